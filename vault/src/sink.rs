//! Blob sink and metadata index
//!
//! The upload and playback stages only depend on the `BlobSink` and
//! `MetadataIndex` traits. `FileSink` and `FileIndex` are the filesystem
//! implementations shipped with the crate.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── objects/
//! │   └── ab/
//! │       └── cdef...        # one stored object, write-once
//! ├── staging/               # in-flight uploads, renamed into objects/
//! └── index.json             # metadata records
//! ```

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SinkError, SinkResult};
use crate::fsutil;

/// Hex length of a storage handle (128 bits)
pub const HANDLE_HEX_LEN: usize = 32;

/// Default and maximum number of search results
pub const MAX_QUERY_RESULTS: usize = 100;

/// Opaque name of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageHandle(String);

impl StorageHandle {
    /// Derive the handle for an object name. Equal names give equal handles.
    pub fn for_name(name: &str) -> Self {
        let digest = blake3::hash(name.as_bytes());
        Self(hex::encode(&digest.as_bytes()[..HANDLE_HEX_LEN / 2]))
    }

    /// Validate a handle received from a caller
    pub fn parse(raw: &str) -> SinkResult<Self> {
        let valid = raw.len() == HANDLE_HEX_LEN
            && raw.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(SinkError::InvalidHandle { handle: raw.to_string() });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn prefix(&self) -> &str {
        &self.0[..2]
    }

    fn remainder(&self) -> &str {
        &self.0[2..]
    }
}

impl std::fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Layout of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredFormat {
    /// One framed chunk record copied out of a container
    ChunkRecord,
    /// `[nonce][tag][ciphertext]`
    LegacyBlob,
}

/// Index record for one uploaded video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub filename: String,
    pub camera_id: String,
    pub upload_date: DateTime<Utc>,
    #[serde(default)]
    pub plate_numbers: Vec<String>,
    pub storage_handle: StorageHandle,
    /// Plaintext size in bytes
    pub file_size: u64,
    pub format: StoredFormat,
    /// Day key of the container the video came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_day: Option<String>,
}

/// Filters for `MetadataIndex::find`; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct VideoQuery {
    pub plate: Option<String>,
    pub camera_id: Option<String>,
    /// Restrict to these cameras, typically the caller's scope
    pub cameras: Option<Vec<String>>,
    /// Inclusive lower bound on `upload_date`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `upload_date`
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl VideoQuery {
    fn matches(&self, record: &VideoMetadata) -> bool {
        if let Some(plate) = &self.plate {
            let plate = normalize_plate(plate);
            if !record.plate_numbers.iter().any(|p| *p == plate) {
                return false;
            }
        }
        if let Some(camera) = &self.camera_id {
            if record.camera_id != *camera {
                return false;
            }
        }
        if let Some(cameras) = &self.cameras {
            if !cameras.iter().any(|c| *c == record.camera_id) {
                return false;
            }
        }
        if self.from.map_or(false, |from| record.upload_date < from) {
            return false;
        }
        if self.until.map_or(false, |until| record.upload_date >= until) {
            return false;
        }
        true
    }

    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(MAX_QUERY_RESULTS).min(MAX_QUERY_RESULTS)
    }
}

/// Plates are stored trimmed and uppercased
pub fn normalize_plate(plate: &str) -> String {
    plate.trim().to_uppercase()
}

/// Receipt for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub handle: StorageHandle,
    pub size: u64,
    /// False when the object already existed and nothing was written
    pub created: bool,
}

/// Write-once blob storage
pub trait BlobSink: Send + Sync {
    /// Store the bytes read from `data` under the handle derived from `name`.
    ///
    /// Storing the same name twice keeps the first object.
    fn put_stream(&self, name: &str, data: &mut dyn Read, content_type: &str) -> SinkResult<PutReceipt>;

    /// Open a stored object for reading
    fn open_read_stream(&self, handle: &StorageHandle) -> SinkResult<Box<dyn Read + Send>>;

    /// Remove a stored object; missing objects are not an error
    fn delete(&self, handle: &StorageHandle) -> SinkResult<()>;
}

/// Queryable metadata store
pub trait MetadataIndex: Send + Sync {
    /// Insert or replace the record with the same storage handle
    fn insert(&self, record: VideoMetadata) -> SinkResult<()>;

    fn get(&self, handle: &StorageHandle) -> SinkResult<Option<VideoMetadata>>;

    /// Matching records, newest upload first
    fn find(&self, query: &VideoQuery) -> SinkResult<Vec<VideoMetadata>>;

    /// Add a plate to a record; returns false when the handle is unknown
    fn append_plate(&self, handle: &StorageHandle, plate: &str) -> SinkResult<bool>;

    /// Drop records older than the retention window, returning them
    fn purge_expired(&self, now: DateTime<Utc>) -> SinkResult<Vec<VideoMetadata>>;
}

/// Filesystem object store with sharded directories
#[derive(Debug, Clone)]
pub struct FileSink {
    base_path: PathBuf,
}

impl FileSink {
    pub fn open(base_path: impl Into<PathBuf>) -> SinkResult<Self> {
        let base_path = base_path.into();
        for dir in [base_path.join("objects"), base_path.join("staging")] {
            fs::create_dir_all(&dir).map_err(|e| unavailable(&dir, e))?;
        }
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn object_path(&self, handle: &StorageHandle) -> PathBuf {
        self.base_path.join("objects").join(handle.prefix()).join(handle.remainder())
    }

    pub fn contains(&self, handle: &StorageHandle) -> bool {
        self.object_path(handle).is_file()
    }
}

fn unavailable(path: &Path, e: io::Error) -> SinkError {
    SinkError::Unavailable { reason: format!("{}: {}", path.display(), e) }
}

impl BlobSink for FileSink {
    fn put_stream(&self, name: &str, data: &mut dyn Read, content_type: &str) -> SinkResult<PutReceipt> {
        let handle = StorageHandle::for_name(name);
        let obj_path = self.object_path(&handle);
        if let Ok(meta) = fs::metadata(&obj_path) {
            debug!("Object {} for {} already stored", handle, name);
            return Ok(PutReceipt { handle, size: meta.len(), created: false });
        }

        let staging_dir = self.base_path.join("staging");
        let staging_path = staging_dir.join(uuid::Uuid::new_v4().simple().to_string());
        let written = (|| -> io::Result<u64> {
            let mut file = File::create(&staging_path)?;
            let size = io::copy(data, &mut file)?;
            file.sync_all()?;
            Ok(size)
        })();
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&staging_path);
                return Err(unavailable(&staging_path, e));
            }
        };

        let prefix_dir = obj_path.parent().unwrap_or(&self.base_path);
        let sealed = fs::create_dir_all(prefix_dir)
            .and_then(|_| fs::rename(&staging_path, &obj_path))
            .and_then(|_| fsutil::sync_dir(prefix_dir));
        if let Err(e) = sealed {
            let _ = fs::remove_file(&staging_path);
            return Err(unavailable(&obj_path, e));
        }

        debug!("Stored {} ({} bytes, {}) as {}", name, size, content_type, handle);
        Ok(PutReceipt { handle, size, created: true })
    }

    fn open_read_stream(&self, handle: &StorageHandle) -> SinkResult<Box<dyn Read + Send>> {
        let path = self.object_path(handle);
        match File::open(&path) {
            Ok(file) => Ok(Box::new(io::BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SinkError::NotFound { handle: handle.to_string() })
            }
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    fn delete(&self, handle: &StorageHandle) -> SinkResult<()> {
        let path = self.object_path(handle);
        fsutil::remove_if_exists(&path).map_err(|e| unavailable(&path, e))?;
        Ok(())
    }
}

/// JSON-file metadata index held in memory behind a lock
#[derive(Debug)]
pub struct FileIndex {
    path: PathBuf,
    retention: Duration,
    records: RwLock<Vec<VideoMetadata>>,
}

impl FileIndex {
    pub fn open(path: impl Into<PathBuf>, retention: Duration) -> SinkResult<Self> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SinkError::IndexCorrupted { reason: e.to_string() })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(unavailable(&path, e)),
        };
        Ok(Self { path, retention, records: RwLock::new(records) })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<VideoMetadata>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<VideoMetadata>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, records: &[VideoMetadata]) -> SinkResult<()> {
        fsutil::write_json_atomic(&self.path, &records).map_err(|e| unavailable(&self.path, e))
    }
}

impl MetadataIndex for FileIndex {
    fn insert(&self, mut record: VideoMetadata) -> SinkResult<()> {
        record.plate_numbers = record.plate_numbers.iter().map(|p| normalize_plate(p)).collect();
        let mut records = self.write();
        match records.iter_mut().find(|r| r.storage_handle == record.storage_handle) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.persist(&records)
    }

    fn get(&self, handle: &StorageHandle) -> SinkResult<Option<VideoMetadata>> {
        Ok(self.read().iter().find(|r| r.storage_handle == *handle).cloned())
    }

    fn find(&self, query: &VideoQuery) -> SinkResult<Vec<VideoMetadata>> {
        let mut found: Vec<VideoMetadata> =
            self.read().iter().filter(|r| query.matches(r)).cloned().collect();
        found.sort_by(|a, b| b.upload_date.cmp(&a.upload_date));
        found.truncate(query.effective_limit());
        Ok(found)
    }

    fn append_plate(&self, handle: &StorageHandle, plate: &str) -> SinkResult<bool> {
        let plate = normalize_plate(plate);
        let mut records = self.write();
        let Some(record) = records.iter_mut().find(|r| r.storage_handle == *handle) else {
            return Ok(false);
        };
        if !record.plate_numbers.contains(&plate) {
            record.plate_numbers.push(plate);
            self.persist(&records)?;
        }
        Ok(true)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> SinkResult<Vec<VideoMetadata>> {
        let cutoff = now - self.retention;
        let mut records = self.write();
        let (expired, kept): (Vec<_>, Vec<_>) =
            records.drain(..).partition(|r| r.upload_date < cutoff);
        *records = kept;
        if !expired.is_empty() {
            self.persist(&records)?;
            info!("Purged {} index records older than {}", expired.len(), cutoff);
        }
        Ok(expired)
    }
}

/// Remove staging leftovers from interrupted uploads
pub fn sweep_staging(sink: &FileSink) -> usize {
    let staging = sink.base_path().join("staging");
    let Ok(entries) = fs::read_dir(&staging) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove staging file {}: {}", entry.path().display(), e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn metadata(handle: &StorageHandle, camera: &str, uploaded: DateTime<Utc>) -> VideoMetadata {
        VideoMetadata {
            filename: format!("{}.mp4", handle),
            camera_id: camera.to_string(),
            upload_date: uploaded,
            plate_numbers: vec![],
            storage_handle: handle.clone(),
            file_size: 10,
            format: StoredFormat::ChunkRecord,
            source_day: Some("2025-06-01".to_string()),
        }
    }

    #[test]
    fn test_handle_parse() {
        let handle = StorageHandle::for_name("cam_01/2025-06-01/abc");
        assert_eq!(handle.as_str().len(), HANDLE_HEX_LEN);
        assert_eq!(StorageHandle::parse(handle.as_str()).unwrap(), handle);
        assert!(StorageHandle::parse("../etc/passwd").is_err());
        assert!(StorageHandle::parse(&handle.as_str().to_uppercase()).is_err());
    }

    #[test]
    fn test_put_is_write_once() {
        let dir = tempdir().unwrap();
        let sink = FileSink::open(dir.path()).unwrap();

        let first = sink.put_stream("obj", &mut Cursor::new(b"first".to_vec()), "video/mp4").unwrap();
        let second = sink.put_stream("obj", &mut Cursor::new(b"other".to_vec()), "video/mp4").unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.handle, second.handle);

        let mut out = Vec::new();
        sink.open_read_stream(&first.handle).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"first");
        assert_eq!(fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_object() {
        let dir = tempdir().unwrap();
        let sink = FileSink::open(dir.path()).unwrap();
        let handle = StorageHandle::for_name("never");
        assert!(matches!(sink.open_read_stream(&handle), Err(SinkError::NotFound { .. })));
        sink.delete(&handle).unwrap();
    }

    #[test]
    fn test_index_upsert_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        let handle = StorageHandle::for_name("a");
        let now = Utc::now();
        {
            let index = FileIndex::open(&path, Duration::days(7)).unwrap();
            index.insert(metadata(&handle, "cam_01", now)).unwrap();
            let mut updated = metadata(&handle, "cam_01", now);
            updated.file_size = 99;
            index.insert(updated).unwrap();
            assert_eq!(index.len(), 1);
        }
        let index = FileIndex::open(&path, Duration::days(7)).unwrap();
        assert_eq!(index.get(&handle).unwrap().unwrap().file_size, 99);
    }

    #[test]
    fn test_find_filters_and_orders() {
        let dir = tempdir().unwrap();
        let index = FileIndex::open(dir.path().join("index.json"), Duration::days(7)).unwrap();
        let now = Utc::now();
        let old = StorageHandle::for_name("old");
        let new = StorageHandle::for_name("new");
        let other = StorageHandle::for_name("other");
        index.insert(metadata(&old, "cam_01", now - Duration::hours(2))).unwrap();
        index.insert(metadata(&new, "cam_01", now)).unwrap();
        index.insert(metadata(&other, "cam_02", now)).unwrap();
        index.append_plate(&old, " ka01ab1234 ").unwrap();

        let all = index.find(&VideoQuery::default()).unwrap();
        assert_eq!(all.len(), 3);

        let cam1 = index
            .find(&VideoQuery { camera_id: Some("cam_01".into()), ..Default::default() })
            .unwrap();
        assert_eq!(cam1[0].storage_handle, new);
        assert_eq!(cam1[1].storage_handle, old);

        let by_plate = index
            .find(&VideoQuery { plate: Some("KA01AB1234".into()), ..Default::default() })
            .unwrap();
        assert_eq!(by_plate.len(), 1);
        assert_eq!(by_plate[0].storage_handle, old);

        let window = index
            .find(&VideoQuery { from: Some(now - Duration::hours(1)), ..Default::default() })
            .unwrap();
        assert_eq!(window.len(), 2);

        let scoped = index
            .find(&VideoQuery { cameras: Some(vec!["cam_02".into()]), ..Default::default() })
            .unwrap();
        assert_eq!(scoped.len(), 1);
    }

    #[test]
    fn test_append_plate_unknown_handle() {
        let dir = tempdir().unwrap();
        let index = FileIndex::open(dir.path().join("index.json"), Duration::days(7)).unwrap();
        assert!(!index.append_plate(&StorageHandle::for_name("x"), "AB12").unwrap());
    }

    #[test]
    fn test_append_plate_is_idempotent() {
        let dir = tempdir().unwrap();
        let index = FileIndex::open(dir.path().join("index.json"), Duration::days(7)).unwrap();
        let handle = StorageHandle::for_name("a");
        index.insert(metadata(&handle, "cam_01", Utc::now())).unwrap();

        assert!(index.append_plate(&handle, "ab12").unwrap());
        assert!(index.append_plate(&handle, "AB12").unwrap());
        assert_eq!(index.get(&handle).unwrap().unwrap().plate_numbers, vec!["AB12"]);
    }

    #[test]
    fn test_purge_expired() {
        let dir = tempdir().unwrap();
        let index = FileIndex::open(dir.path().join("index.json"), Duration::days(7)).unwrap();
        let now = Utc::now();
        let stale = StorageHandle::for_name("stale");
        let fresh = StorageHandle::for_name("fresh");
        index.insert(metadata(&stale, "cam_01", now - Duration::days(8))).unwrap();
        index.insert(metadata(&fresh, "cam_01", now - Duration::days(6))).unwrap();

        let purged = index.purge_expired(now).unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].storage_handle, stale);
        assert!(index.get(&stale).unwrap().is_none());
        assert!(index.get(&fresh).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_index_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            FileIndex::open(&path, Duration::days(7)),
            Err(SinkError::IndexCorrupted { .. })
        ));
    }
}
