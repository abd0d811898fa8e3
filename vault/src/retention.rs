//! Retention sweeper: expires index records and deletes their objects

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sink::{BlobSink, MetadataIndex};

/// Counts from one retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub objects_deleted: usize,
    pub delete_failures: usize,
}

/// Periodically drops videos older than the index's retention window
pub struct RetentionSweeper {
    index: Arc<dyn MetadataIndex>,
    sink: Arc<dyn BlobSink>,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(index: Arc<dyn MetadataIndex>, sink: Arc<dyn BlobSink>, interval: Duration) -> Self {
        Self { index, sink, interval }
    }

    /// Expire records older than the window ending at `now`.
    ///
    /// A record is removed from the index before its object is deleted, so a
    /// failed delete leaves an orphaned object rather than a dangling record.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.index.purge_expired(now)?;
        let mut report = SweepReport { expired: expired.len(), ..Default::default() };

        for record in expired {
            match self.sink.delete(&record.storage_handle) {
                Ok(()) => {
                    debug!("Deleted expired object {} ({})", record.storage_handle, record.filename);
                    report.objects_deleted += 1;
                }
                Err(e) => {
                    warn!("Could not delete expired object {}: {}", record.storage_handle, e);
                    report.delete_failures += 1;
                }
            }
        }
        Ok(report)
    }

    /// Sweep on every tick until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Retention sweeper running every {:?}", self.interval);
        let sweeper = Arc::new(self);
        let mut ticker = interval(sweeper.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let worker = sweeper.clone();
                    match tokio::task::spawn_blocking(move || worker.sweep_once(Utc::now())).await {
                        Ok(Ok(report)) if report.expired > 0 => info!(
                            "Retention sweep expired {} videos ({} objects deleted, {} failures)",
                            report.expired, report.objects_deleted, report.delete_failures
                        ),
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("Retention sweep failed: {}", e),
                        Err(e) => warn!("Retention sweep task failed: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Retention sweeper received shutdown signal");
                    break;
                }
            }
        }
        Ok(())
    }
}
