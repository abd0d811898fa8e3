//! Upload stage: ships container chunks to the blob sink
//!
//! Each complete chunk is uploaded as its own object holding the framed
//! chunk record, and gets its own index record. A cursor file next to the
//! container remembers how far uploads have progressed, so a container that
//! is still growing can be revisited on every scan.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::DayClock;
use crate::error::{ContainerError, Result, VaultError};
use crate::format::{container_day, ChunkFrame, ContainerReader, DayHeader};
use crate::fsutil;
use crate::pump::{Outcome, SegmentProcessor};
use crate::sink::{BlobSink, MetadataIndex, StoredFormat, VideoMetadata};

/// Upload progress through one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCursor {
    /// Offset one past the last uploaded record
    pub offset: u64,
    /// Number of chunks uploaded so far
    pub uploaded: u64,
}

impl UploadCursor {
    /// Cursor file path for a container
    pub fn path_for(container: &Path) -> PathBuf {
        let mut name = container.as_os_str().to_os_string();
        name.push(".cursor");
        PathBuf::from(name)
    }

    pub fn load(container: &Path) -> Result<Self> {
        match fs::read(Self::path_for(container)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, container: &Path) -> Result<()> {
        fsutil::write_json_atomic(&Self::path_for(container), self)?;
        Ok(())
    }
}

/// Object name for a chunk; equal nonce and tag always map to the same handle
pub fn object_name(day_header: &DayHeader, nonce: &[u8], tag: &[u8]) -> String {
    let digest = blake3::Hasher::new().update(nonce).update(tag).finalize();
    format!("{}/{}/{}", day_header.camera_id, day_header.date, digest.to_hex())
}

/// How long a closed container's torn tail must sit unchanged before it is dropped
pub const DEFAULT_TORN_TAIL_GRACE: Duration = Duration::from_secs(60);

/// `SegmentProcessor` that uploads container chunks past the cursor
pub struct ContainerUploader {
    sink: Arc<dyn BlobSink>,
    index: Arc<dyn MetadataIndex>,
    clock: DayClock,
    torn_tail_grace: Duration,
}

/// Counts from uploading one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub already_stored: usize,
    /// The container ends with an incomplete or unreadable record
    pub torn_tail: bool,
    pub cursor: UploadCursor,
    /// Offset one past the last complete record seen, header included
    pub scanned_to: u64,
}

impl ContainerUploader {
    pub fn new(sink: Arc<dyn BlobSink>, index: Arc<dyn MetadataIndex>, clock: DayClock) -> Self {
        Self { sink, index, clock, torn_tail_grace: DEFAULT_TORN_TAIL_GRACE }
    }

    pub fn with_torn_tail_grace(mut self, grace: Duration) -> Self {
        self.torn_tail_grace = grace;
        self
    }

    /// Upload every complete chunk after the cursor, advancing it per chunk
    pub fn upload_container(&self, path: &Path) -> Result<UploadReport> {
        let mut reader = ContainerReader::open(path)?;
        let day_header = reader.day_header().clone();
        let mut cursor = UploadCursor::load(path)?;
        if cursor.offset > reader.limit() {
            warn!("Cursor for {} is past the end of the file, restarting", path.display());
            cursor = UploadCursor::default();
        }
        if cursor.offset > 0 {
            reader.resume_at(cursor.offset);
        }

        let mut report = UploadReport::default();
        while let Some(frame) = reader.next_frame() {
            let frame = match frame {
                Ok(frame) => frame,
                Err(ContainerError::Truncated { offset, .. }) => {
                    debug!("Container {} ends mid-record at offset {}", path.display(), offset);
                    report.torn_tail = true;
                    break;
                }
                Err(e @ ContainerError::CorruptHeader { .. }) | Err(e @ ContainerError::HeaderTooLarge { .. }) => {
                    warn!("Container {} has an unreadable record: {}", path.display(), e);
                    report.torn_tail = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let created = self.upload_chunk(&mut reader, &day_header, &frame)?;
            if created {
                report.uploaded += 1;
            } else {
                report.already_stored += 1;
            }
            cursor.offset = frame.end_offset();
            cursor.uploaded += 1;
            cursor.save(path)?;
        }

        report.scanned_to = cursor.offset.max(reader.first_chunk_offset());
        report.cursor = cursor;
        Ok(report)
    }

    fn upload_chunk<R: io::Read + io::Seek>(
        &self,
        reader: &mut ContainerReader<R>,
        day_header: &DayHeader,
        frame: &ChunkFrame,
    ) -> Result<bool> {
        let (nonce, tag) = reader.read_nonce_tag(frame)?;
        let name = object_name(day_header, &nonce, &tag);

        let mut raw = reader.raw_record(frame)?;
        let receipt = self.sink.put_stream(&name, &mut raw, "application/octet-stream")?;
        if receipt.size != frame.record_len() {
            return Err(VaultError::Generic(format!(
                "stored object {} has {} bytes, expected {}",
                receipt.handle,
                receipt.size,
                frame.record_len()
            )));
        }

        if self.index.get(&receipt.handle)?.is_none() {
            self.index.insert(VideoMetadata {
                filename: frame.header.original_filename.clone(),
                camera_id: day_header.camera_id.clone(),
                upload_date: Utc::now(),
                plate_numbers: Vec::new(),
                storage_handle: receipt.handle.clone(),
                file_size: frame.header.plaintext_size,
                format: StoredFormat::ChunkRecord,
                source_day: Some(day_header.date.clone()),
            })?;
            info!(
                "Uploaded {} from {} as {}",
                frame.header.original_filename, day_header.date, receipt.handle
            );
        }
        Ok(receipt.created)
    }
}

impl SegmentProcessor for ContainerUploader {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn process(&mut self, path: &Path) -> Result<Outcome> {
        let report = self.upload_container(path)?;
        let Some(day) = container_day(path) else {
            return Ok(Outcome::Retained);
        };

        // Today's container may still grow.
        if day >= self.clock.today_key() {
            return Ok(Outcome::Retained);
        }

        // An encryptor that took its day key before midnight may still be appending.
        let meta = fs::metadata(path)?;
        if meta.len() != report.scanned_to {
            if !report.torn_tail {
                debug!(
                    "Container {} grew to {} bytes during upload, revisiting",
                    path.display(),
                    meta.len()
                );
                return Ok(Outcome::Retained);
            }
            let idle = meta.modified()?.elapsed().unwrap_or_default();
            if idle < self.torn_tail_grace {
                debug!("Container {} has a recent torn tail, revisiting", path.display());
                return Ok(Outcome::Retained);
            }
            warn!(
                "Dropping torn tail of closed container {} ({} bytes)",
                path.display(),
                meta.len().saturating_sub(report.scanned_to)
            );
        }
        fsutil::remove_if_exists(&UploadCursor::path_for(path))?;
        info!("Container {} fully uploaded ({} chunks)", path.display(), report.cursor.uploaded);
        Ok(Outcome::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;
    use crate::crypto::{ChunkEncryptor, SourceInfo};
    use crate::keys::KeyMaterial;
    use crate::error::SinkResult;
    use crate::format::ChunkRecord;
    use crate::sink::{FileIndex, FileSink, PutReceipt, StorageHandle, VideoQuery};
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        writer: ContainerWriter,
        encryptor: ChunkEncryptor,
        sink: Arc<FileSink>,
        index: Arc<FileIndex>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let writer = ContainerWriter::open(dir.path().join("enc"), "container", "cam_01", dir.path().join("log.json")).unwrap();
        let sink = Arc::new(FileSink::open(dir.path().join("sink")).unwrap());
        let index = Arc::new(FileIndex::open(dir.path().join("sink/index.json"), chrono::Duration::days(7)).unwrap());
        Fixture {
            _dir: dir,
            writer,
            encryptor: ChunkEncryptor::new(Arc::new(KeyMaterial::generate())),
            sink,
            index,
        }
    }

    impl Fixture {
        fn add(&mut self, day: &str, name: &str, size: usize) {
            let record = self
                .encryptor
                .encrypt(vec![1u8; size], SourceInfo { filename: name.to_string(), modified: Utc::now() })
                .unwrap();
            self.writer.append(day, &record).unwrap();
        }

        fn uploader(&self, today: &str) -> ContainerUploader {
            let date = NaiveDate::parse_from_str(today, "%Y-%m-%d").unwrap();
            ContainerUploader::new(self.sink.clone(), self.index.clone(), DayClock::Fixed(date))
        }
    }

    #[test]
    fn test_growing_container_is_retained_and_resumed() {
        let mut fx = fixture();
        fx.add("2025-06-01", "a.mp4", 10);
        let path = fx.writer.container_path("2025-06-01");
        let mut uploader = fx.uploader("2025-06-01");

        assert_eq!(uploader.process(&path).unwrap(), Outcome::Retained);
        assert_eq!(UploadCursor::load(&path).unwrap().uploaded, 1);

        fx.add("2025-06-01", "b.mp4", 20);
        let report = uploader.upload_container(&path).unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.cursor.uploaded, 2);
        assert_eq!(report.cursor.offset, fs::metadata(&path).unwrap().len());
        assert_eq!(fx.index.find(&VideoQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_past_day_is_consumed_with_cursor() {
        let mut fx = fixture();
        fx.add("2025-06-01", "a.mp4", 10);
        let path = fx.writer.container_path("2025-06-01");

        assert_eq!(fx.uploader("2025-06-02").process(&path).unwrap(), Outcome::Consumed);
        assert!(!UploadCursor::path_for(&path).exists());

        let records = fx.index.find(&VideoQuery::default()).unwrap();
        assert_eq!(records[0].filename, "a.mp4");
        assert_eq!(records[0].file_size, 10);
        assert_eq!(records[0].source_day.as_deref(), Some("2025-06-01"));
        assert!(fx.sink.contains(&records[0].storage_handle));
    }

    /// Appends one more chunk to the container on its first upload
    struct AppendingSink {
        inner: Arc<FileSink>,
        pending: Mutex<Option<(ContainerWriter, ChunkRecord)>>,
    }

    impl BlobSink for AppendingSink {
        fn put_stream(&self, name: &str, data: &mut dyn io::Read, content_type: &str) -> SinkResult<PutReceipt> {
            if let Some((mut writer, record)) = self.pending.lock().unwrap().take() {
                writer.append("2025-06-01", &record).unwrap();
            }
            self.inner.put_stream(name, data, content_type)
        }

        fn open_read_stream(&self, handle: &StorageHandle) -> SinkResult<Box<dyn io::Read + Send>> {
            self.inner.open_read_stream(handle)
        }

        fn delete(&self, handle: &StorageHandle) -> SinkResult<()> {
            self.inner.delete(handle)
        }
    }

    #[test]
    fn test_append_during_upload_keeps_closed_container() {
        let mut fx = fixture();
        fx.add("2025-06-01", "a.mp4", 10);
        let path = fx.writer.container_path("2025-06-01");

        // A second writer that took its day key just before midnight
        let late_writer = ContainerWriter::open(
            fx._dir.path().join("enc"),
            "container",
            "cam_01",
            fx._dir.path().join("late-log.json"),
        )
        .unwrap();
        let late = fx
            .encryptor
            .encrypt(vec![2u8; 30], SourceInfo { filename: "late.mp4".to_string(), modified: Utc::now() })
            .unwrap();
        let sink = Arc::new(AppendingSink { inner: fx.sink.clone(), pending: Mutex::new(Some((late_writer, late))) });
        let date = NaiveDate::parse_from_str("2025-06-02", "%Y-%m-%d").unwrap();
        let mut uploader = ContainerUploader::new(sink, fx.index.clone(), DayClock::Fixed(date));

        assert_eq!(uploader.process(&path).unwrap(), Outcome::Retained);
        assert!(path.exists());

        assert_eq!(uploader.process(&path).unwrap(), Outcome::Consumed);
        let mut names: Vec<_> = fx.index.find(&VideoQuery::default()).unwrap().into_iter().map(|v| v.filename).collect();
        names.sort();
        assert_eq!(names, vec!["a.mp4", "late.mp4"]);
    }

    #[test]
    fn test_recent_torn_tail_is_retained() {
        let mut fx = fixture();
        fx.add("2025-06-01", "a.mp4", 10);
        let path = fx.writer.container_path("2025-06-01");
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        io::Write::write_all(&mut file, &[0u8, 0, 0]).unwrap();
        drop(file);

        let mut uploader = fx.uploader("2025-06-02");
        assert_eq!(uploader.process(&path).unwrap(), Outcome::Retained);
        assert!(path.exists());

        let mut uploader = fx.uploader("2025-06-02").with_torn_tail_grace(Duration::ZERO);
        assert_eq!(uploader.process(&path).unwrap(), Outcome::Consumed);
        assert_eq!(fx.index.len(), 1);
    }

    #[test]
    fn test_empty_closed_container_is_consumed() {
        let fx = fixture();
        let path = fx.writer.container_path("2025-06-01");
        fs::write(&path, DayHeader::new("2025-06-01", "cam_01").to_bytes().unwrap()).unwrap();

        assert_eq!(fx.uploader("2025-06-02").process(&path).unwrap(), Outcome::Consumed);
    }

    #[test]
    fn test_lost_cursor_does_not_duplicate() {
        let mut fx = fixture();
        fx.add("2025-06-01", "a.mp4", 10);
        let path = fx.writer.container_path("2025-06-01");
        let uploader = fx.uploader("2025-06-01");

        uploader.upload_container(&path).unwrap();
        fs::remove_file(UploadCursor::path_for(&path)).unwrap();
        let report = uploader.upload_container(&path).unwrap();

        assert_eq!(report.uploaded, 0);
        assert_eq!(report.already_stored, 1);
        assert_eq!(fx.index.len(), 1);
    }

    #[test]
    fn test_object_name_is_deterministic() {
        let header = DayHeader::new("2025-06-01", "cam_01");
        assert_eq!(object_name(&header, &[1; 16], &[2; 16]), object_name(&header, &[1; 16], &[2; 16]));
        assert_ne!(object_name(&header, &[1; 16], &[2; 16]), object_name(&header, &[1; 16], &[3; 16]));
    }
}
