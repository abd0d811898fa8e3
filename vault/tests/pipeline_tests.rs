//! End-to-end tests: raw segment to container to sink to range playback

use std::fs::{self, OpenOptions};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::StreamExt;
use tempfile::TempDir;

use camvault::{
    clock::DayClock,
    config::VaultConfig,
    container::ContainerWriter,
    crypto::ChunkEncryptor,
    error::VaultError,
    format::{ContainerReader, StopReason},
    keys::KeyMaterial,
    pipeline::EncryptStage,
    playback::{RangeStreamReader, Source},
    pump::DirectoryPump,
    service::Store,
    sink::{BlobSink, MetadataIndex, VideoQuery},
    stability::StabilityDetector,
    uploader::ContainerUploader,
};

const SEGMENT_SIZE: usize = 5 * 1024 * 1024;

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

fn test_config() -> (VaultConfig, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = VaultConfig::with_base_dir(temp_dir.path());
    (config, temp_dir)
}

fn writer(config: &VaultConfig) -> ContainerWriter {
    ContainerWriter::open(
        &config.storage.encrypted_dir,
        &config.pipeline.container_extension,
        &config.pipeline.camera_id,
        &config.storage.processed_log_path,
    )
    .unwrap()
}

fn segment_bytes() -> Vec<u8> {
    (0..SEGMENT_SIZE).map(|i| (i % 253) as u8).collect()
}

#[tokio::test]
async fn test_segment_to_range_playback() {
    let (config, _temp_dir) = test_config();
    let key = Arc::new(KeyMaterial::generate());
    fs::create_dir_all(&config.storage.raw_dir).unwrap();
    let plaintext = segment_bytes();
    fs::write(config.storage.raw_dir.join("seg1.mp4"), &plaintext).unwrap();

    // Encrypt on 2025-06-01
    let stage = EncryptStage::new(ChunkEncryptor::new(key.clone()), writer(&config), DayClock::Fixed(date("2025-06-01")));
    let mut encrypt = DirectoryPump::new(
        &config.storage.raw_dir,
        "mp4",
        StabilityDetector::new(Duration::from_millis(20)),
        Duration::from_millis(10),
        stage,
    );
    let report = encrypt.scan_once().await.unwrap();
    assert_eq!(report.consumed, 1);
    assert!(!config.storage.raw_dir.join("seg1.mp4").exists());

    let container = config.storage.encrypted_dir.join("2025-06-01.container");
    let scan = ContainerReader::open(&container).unwrap().scan();
    assert!(scan.is_clean());
    assert_eq!(scan.frames.len(), 1);
    assert_eq!(scan.frames[0].header.original_filename, "seg1.mp4");
    assert_eq!(scan.frames[0].header.plaintext_size, SEGMENT_SIZE as u64);
    assert_eq!(scan.frames[0].header.duration_estimate, 5);
    assert_eq!(scan.frames[0].header.markers, vec!["00:00", "00:03"]);

    // Upload the next day, so the container is closed
    let store = Store::open(&config).unwrap();
    let uploader = ContainerUploader::new(store.sink.clone(), store.index.clone(), DayClock::Fixed(date("2025-06-02")));
    let mut upload = DirectoryPump::new(
        &config.storage.encrypted_dir,
        "container",
        StabilityDetector::new(Duration::from_millis(20)),
        Duration::from_millis(10),
        uploader,
    );
    let report = upload.scan_once().await.unwrap();
    assert_eq!(report.consumed, 1);
    assert!(!container.exists());

    let records = store.index.find(&VideoQuery::default()).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.filename, "seg1.mp4");
    assert_eq!(record.camera_id, "cam_01");
    assert!(record.plate_numbers.is_empty());
    assert_eq!(record.file_size, 5_242_880);

    // Range playback from the sink
    let reader = RangeStreamReader::new(key, store.sink.clone(), config.server.temp_dir.clone(), 64 * 1024);
    let source = Source::Remote { handle: record.storage_handle.clone(), format: record.format };
    let response = reader.open(source, Some("bytes=0-1023")).await.unwrap();
    assert_eq!(response.status().as_u16(), 206);
    assert_eq!(response.content_length(), 1024);
    assert_eq!(response.content_range().unwrap(), format!("bytes 0-1023/{}", SEGMENT_SIZE));

    let mut body = response.body;
    let mut received = Vec::new();
    while let Some(piece) = body.next().await {
        received.extend_from_slice(&piece.unwrap());
    }
    assert_eq!(received, &plaintext[..1024]);
    drop(body);
    assert_eq!(fs::read_dir(&config.server.temp_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_torn_tail_is_recovered_on_next_append() {
    let (config, _temp_dir) = test_config();
    let encryptor = ChunkEncryptor::new(Arc::new(KeyMaterial::generate()));
    fs::create_dir_all(&config.storage.raw_dir).unwrap();

    let mut first = writer(&config);
    for (name, size) in [("a.mp4", 1000), ("b.mp4", 2000), ("c.mp4", 3000)] {
        let path = config.storage.raw_dir.join(name);
        fs::write(&path, vec![7u8; size]).unwrap();
        first.append("2025-06-01", &encryptor.encrypt_file(&path).unwrap()).unwrap();
    }
    let container = first.container_path("2025-06-01");
    drop(first);

    // Cut inside the third chunk's ciphertext
    let len = fs::metadata(&container).unwrap().len();
    OpenOptions::new().write(true).open(&container).unwrap().set_len(len - 1500).unwrap();

    let scan = ContainerReader::open(&container).unwrap().scan();
    assert_eq!(scan.frames.len(), 2);
    assert!(matches!(scan.stopped_by, Some(StopReason::Truncated { .. })));

    let mut second = writer(&config);
    let path = config.storage.raw_dir.join("d.mp4");
    fs::write(&path, vec![9u8; 500]).unwrap();
    second.append("2025-06-01", &encryptor.encrypt_file(&path).unwrap()).unwrap();

    let scan = ContainerReader::open(&container).unwrap().scan();
    assert!(scan.is_clean());
    let names: Vec<_> = scan.frames.iter().map(|f| f.header.original_filename.as_str()).collect();
    assert_eq!(names, vec!["a.mp4", "b.mp4", "d.mp4"]);
}

#[test]
fn test_lost_log_does_not_allow_duplicate_append() {
    let (config, _temp_dir) = test_config();
    let encryptor = ChunkEncryptor::new(Arc::new(KeyMaterial::generate()));
    fs::create_dir_all(&config.storage.raw_dir).unwrap();
    let path = config.storage.raw_dir.join("seg1.mp4");
    fs::write(&path, b"footage").unwrap();

    writer(&config).append("2025-06-01", &encryptor.encrypt_file(&path).unwrap()).unwrap();
    // Crash between the container fsync and the log persist
    fs::remove_file(&config.storage.processed_log_path).unwrap();

    let err = writer(&config)
        .append("2025-06-01", &encryptor.encrypt_file(&path).unwrap())
        .unwrap_err();
    assert!(matches!(err, VaultError::DuplicateSource { .. }));
    assert_eq!(camvault::container::count_chunks(writer(&config).container_path("2025-06-01")).unwrap(), 1);
}

#[tokio::test]
async fn test_retained_container_is_not_reuploaded() {
    let (config, _temp_dir) = test_config();
    let encryptor = ChunkEncryptor::new(Arc::new(KeyMaterial::generate()));
    fs::create_dir_all(&config.storage.raw_dir).unwrap();
    let path = config.storage.raw_dir.join("seg1.mp4");
    fs::write(&path, vec![1u8; 4096]).unwrap();
    let mut writer = writer(&config);
    writer.append("2025-06-01", &encryptor.encrypt_file(&path).unwrap()).unwrap();

    let store = Store::open(&config).unwrap();
    let uploader = ContainerUploader::new(store.sink.clone(), store.index.clone(), DayClock::Fixed(date("2025-06-01")));
    let mut upload = DirectoryPump::new(
        &config.storage.encrypted_dir,
        "container",
        StabilityDetector::new(Duration::from_millis(10)),
        Duration::from_millis(10),
        uploader,
    );

    for _ in 0..3 {
        let report = upload.scan_once().await.unwrap();
        assert_eq!(report.retained, 1);
    }
    let records = store.index.find(&VideoQuery::default()).unwrap();
    assert_eq!(records.len(), 1);

    let mut stored = Vec::new();
    store.sink.open_read_stream(&records[0].storage_handle).unwrap().read_to_end(&mut stored).unwrap();
    let container_bytes = fs::read(writer.container_path("2025-06-01")).unwrap();
    assert!(container_bytes.ends_with(&stored));
}
