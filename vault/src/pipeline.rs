//! Encryption stage: raw segments into the day's container

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::DayClock;
use crate::container::ContainerWriter;
use crate::crypto::ChunkEncryptor;
use crate::error::{Result, VaultError};
use crate::pump::{Outcome, SegmentProcessor};

/// `SegmentProcessor` that encrypts a segment and appends it to today's container
pub struct EncryptStage {
    encryptor: ChunkEncryptor,
    writer: ContainerWriter,
    clock: DayClock,
    pruned_for: Option<String>,
}

impl EncryptStage {
    pub fn new(encryptor: ChunkEncryptor, writer: ContainerWriter, clock: DayClock) -> Self {
        Self { encryptor, writer, clock, pruned_for: None }
    }

    pub fn writer(&self) -> &ContainerWriter {
        &self.writer
    }

    /// A source whose name is already stored is deleted only when the stored
    /// chunk came from this same file.
    fn settle_stored(&mut self, day: &str, filename: &str, path: &Path) -> Result<Outcome> {
        let meta = fs::metadata(path)?;
        let modified = meta.modified().ok().map(DateTime::<Utc>::from);
        match self.writer.stored_header(day, filename)? {
            Some(header) if header.plaintext_size == meta.len() && Some(header.timestamp) == modified => {
                debug!("{} already stored in container for {}", filename, day);
                Ok(Outcome::Consumed)
            }
            Some(_) => {
                warn!(
                    "{} reuses the name of a different segment stored for {}, leaving it in place",
                    path.display(),
                    day
                );
                Ok(Outcome::Retained)
            }
            None => {
                warn!("{} is logged for {} but missing from its container, leaving it in place", filename, day);
                Ok(Outcome::Retained)
            }
        }
    }
}

impl SegmentProcessor for EncryptStage {
    fn name(&self) -> &'static str {
        "encrypt"
    }

    fn process(&mut self, path: &Path) -> Result<Outcome> {
        let day = self.clock.today_key();
        if self.pruned_for.as_deref() != Some(day.as_str()) {
            self.writer.prune_before(&day)?;
            self.pruned_for = Some(day.clone());
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| format!("source path has no usable file name: {}", path.display()))?;

        // Possibly folded in by an earlier run that stopped before deleting the source.
        if self.writer.is_processed(&day, filename)? {
            return self.settle_stored(&day, filename, path);
        }

        let record = self.encryptor.encrypt_file(path)?;
        match self.writer.append(&day, &record) {
            Ok(receipt) => {
                debug!("{} stored at offset {} of {}", filename, receipt.offset, day);
                Ok(Outcome::Consumed)
            }
            Err(VaultError::DuplicateSource { .. }) => self.settle_stored(&day, filename, path),
            Err(e) => Err(e),
        }
    }
}
