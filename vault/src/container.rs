//! Daily container writer and processed-source log
//!
//! The writer is the only appender of a day's container. A source filename
//! enters the processed log only after its chunk has been fsynced, and the
//! container itself is treated as the source of truth when the writer first
//! touches a day: torn tails are cut back to the last complete record and
//! every filename found in the container is folded into the log.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ContainerError, Result, VaultError};
use crate::format::{ChunkHeader, ChunkRecord, ContainerReader, DayHeader, StopReason, CIPHER_SUITE};
use crate::fsutil;

/// Day key to the set of source filenames folded into that day's container
#[derive(Debug)]
pub struct ProcessedLog {
    path: PathBuf,
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ProcessedLog {
    /// Load the log, starting empty when the file does not exist yet
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    // Containers are authoritative; recovery refolds their names.
                    warn!("Processed log {} is unreadable, starting empty: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn contains(&self, day: &str, filename: &str) -> bool {
        self.entries.get(day).map_or(false, |names| names.contains(filename))
    }

    /// Record a filename; returns false when it was already present
    pub fn insert(&mut self, day: &str, filename: &str) -> bool {
        self.entries.entry(day.to_string()).or_default().insert(filename.to_string())
    }

    /// Forget every day before `day`; returns how many days were dropped
    pub fn prune_before(&mut self, day: &str) -> usize {
        let kept = self.entries.split_off(day);
        let dropped = self.entries.len();
        self.entries = kept;
        dropped
    }

    /// Persist atomically: temp file, fsync, rename
    pub fn persist(&self) -> Result<()> {
        fsutil::write_json_atomic(&self.path, &self.entries)?;
        Ok(())
    }
}

/// Where a chunk landed in its container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReceipt {
    pub offset: u64,
    pub len: u64,
}

/// What recovery found when a day's container was first opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub chunks: usize,
    pub truncated_bytes: u64,
    pub folded_into_log: usize,
}

/// Owns the per-day containers of one camera and the processed log
#[derive(Debug)]
pub struct ContainerWriter {
    dir: PathBuf,
    extension: String,
    camera_id: String,
    log: ProcessedLog,
    recovered: HashSet<String>,
}

impl ContainerWriter {
    pub fn open<P: AsRef<Path>, L: AsRef<Path>>(
        dir: P,
        extension: &str,
        camera_id: &str,
        log_path: L,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            extension: extension.to_string(),
            camera_id: camera_id.to_string(),
            log: ProcessedLog::load(log_path)?,
            recovered: HashSet::new(),
        })
    }

    pub fn container_path(&self, day: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", day, self.extension))
    }

    pub fn log(&self) -> &ProcessedLog {
        &self.log
    }

    /// True when `filename` is already stored in `day`'s container
    pub fn is_processed(&mut self, day: &str, filename: &str) -> Result<bool> {
        self.ensure_recovered(day)?;
        Ok(self.log.contains(day, filename))
    }

    /// Drop log entries for days before `day`, which no longer receive appends
    pub fn prune_before(&mut self, day: &str) -> Result<usize> {
        self.recovered.retain(|d| d.as_str() >= day);
        let dropped = self.log.prune_before(day);
        if dropped > 0 {
            self.log.persist()?;
            info!("Pruned {} closed days from processed log", dropped);
        }
        Ok(dropped)
    }

    /// Header of the chunk stored for `filename` in `day`'s container
    pub fn stored_header(&mut self, day: &str, filename: &str) -> Result<Option<ChunkHeader>> {
        self.ensure_recovered(day)?;
        let path = self.container_path(day);
        if !path.exists() {
            return Ok(None);
        }
        let scan = ContainerReader::open(&path)?.scan();
        Ok(scan
            .frames
            .into_iter()
            .map(|frame| frame.header)
            .find(|header| header.original_filename == filename))
    }

    /// Append a chunk to `day`'s container, creating it with a day header
    /// on first write. Fails with `DuplicateSource` if the source is
    /// already stored.
    pub fn append(&mut self, day: &str, record: &ChunkRecord) -> Result<AppendReceipt> {
        self.ensure_recovered(day)?;
        let filename = &record.header.original_filename;
        if self.log.contains(day, filename) {
            return Err(VaultError::DuplicateSource {
                day: day.to_string(),
                filename: filename.clone(),
            });
        }

        let bytes = record.to_bytes()?;
        let path = self.container_path(day);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let created = file.metadata()?.len() == 0;
        if created {
            let header = DayHeader::new(day, self.camera_id.as_str());
            file.write_all(&header.to_bytes()?)?;
            info!("Created container {} for camera {}", path.display(), self.camera_id);
        }

        let offset = file.metadata()?.len();
        if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_data()) {
            self.abandon_append(day, &file, offset);
            return Err(e.into());
        }
        if created {
            fsutil::sync_dir(&self.dir)?;
        }

        self.log.insert(day, filename);
        self.log.persist()?;

        debug!(
            "Appended {} ({} bytes) to {} at offset {}",
            filename,
            bytes.len(),
            path.display(),
            offset
        );
        Ok(AppendReceipt { offset, len: bytes.len() as u64 })
    }

    /// Cut a partial append back to `offset` and force recovery before the
    /// next append to `day`, in case the cut itself failed.
    fn abandon_append(&mut self, day: &str, file: &fs::File, offset: u64) {
        if let Err(e) = file.set_len(offset) {
            warn!(
                "Failed to cut partial append to {} at offset {}: {}",
                self.container_path(day).display(),
                offset,
                e
            );
        }
        self.recovered.remove(day);
    }

    fn ensure_recovered(&mut self, day: &str) -> Result<()> {
        if self.recovered.contains(day) {
            return Ok(());
        }
        let report = self.recover_day(day)?;
        if report.truncated_bytes > 0 || report.folded_into_log > 0 {
            info!(
                "Recovered container for {}: {} chunks, {} torn bytes removed, {} names folded into log",
                day, report.chunks, report.truncated_bytes, report.folded_into_log
            );
        }
        self.recovered.insert(day.to_string());
        Ok(())
    }

    /// Reconcile `day`'s container with the log.
    pub fn recover_day(&mut self, day: &str) -> Result<RecoveryReport> {
        let path = self.container_path(day);
        let file_len = match fs::metadata(&path) {
            Ok(meta) if meta.len() == 0 => return Ok(RecoveryReport::default()),
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RecoveryReport::default()),
            Err(e) => return Err(e.into()),
        };

        let scan = match ContainerReader::open(&path) {
            Ok(reader) => reader.scan(),
            // A crash while writing the day header leaves nothing worth keeping.
            Err(VaultError::Container(ContainerError::Truncated { .. }))
            | Err(VaultError::Container(ContainerError::MissingDayHeader)) => {
                warn!("Container {} has a torn day header, resetting it", path.display());
                truncate_to(&path, 0)?;
                return Ok(RecoveryReport { truncated_bytes: file_len, ..Default::default() });
            }
            Err(e) => return Err(e),
        };

        if scan.day_header.cipher_suite != CIPHER_SUITE {
            return Err(ContainerError::UnsupportedSuite { suite: scan.day_header.cipher_suite }.into());
        }

        let mut report = RecoveryReport { chunks: scan.frames.len(), ..Default::default() };
        if let Some(reason) = &scan.stopped_by {
            match reason {
                StopReason::Truncated { offset } => {
                    warn!("Container {} has a torn chunk at offset {}", path.display(), offset)
                }
                StopReason::Corrupt { offset, reason } => {
                    warn!("Container {} has an unreadable chunk at offset {}: {}", path.display(), offset, reason)
                }
            }
            truncate_to(&path, scan.valid_len)?;
            report.truncated_bytes = file_len - scan.valid_len;
        }

        for frame in &scan.frames {
            if self.log.insert(day, &frame.header.original_filename) {
                report.folded_into_log += 1;
            }
        }
        if report.folded_into_log > 0 {
            self.log.persist()?;
        }
        Ok(report)
    }
}

fn truncate_to(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

/// Number of chunk records in a container, ignoring a torn tail
pub fn count_chunks<P: AsRef<Path>>(path: P) -> Result<usize> {
    Ok(ContainerReader::open(path)?.scan().frames.len())
}
