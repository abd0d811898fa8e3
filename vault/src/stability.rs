//! Write-stability detection for watched files
//!
//! A file is considered finished when its size is unchanged across a quiet
//! period. This is a heuristic, not a lock: a writer that pauses for exactly
//! the quiet period and then resumes produces a false positive.

use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tokio::time::sleep;

/// Result of one stability check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// Size unchanged across the quiet period
    Stable { size: u64 },
    /// Size changed while waiting
    Growing { before: u64, after: u64 },
    /// The file disappeared before or during the check
    Vanished,
}

impl Stability {
    pub fn is_stable(&self) -> bool {
        matches!(self, Stability::Stable { .. })
    }
}

/// Samples a file's size twice, a quiet period apart
#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    quiet_period: Duration,
}

impl StabilityDetector {
    pub fn new(quiet_period: Duration) -> Self {
        Self { quiet_period }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Check the file. Never errors; a missing file is `Vanished`.
    pub async fn check(&self, path: &Path) -> Stability {
        let Some(before) = file_size(path).await else {
            return Stability::Vanished;
        };
        sleep(self.quiet_period).await;
        match file_size(path).await {
            None => Stability::Vanished,
            Some(after) if after == before => Stability::Stable { size: after },
            Some(after) => Stability::Growing { before, after },
        }
    }

    pub async fn is_stable(&self, path: &Path) -> bool {
        self.check(path).await.is_stable()
    }
}

async fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).await.ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// True iff `path` still exists and kept its size across `quiet_period`
pub async fn is_stable(path: &Path, quiet_period: Duration) -> bool {
    StabilityDetector::new(quiet_period).is_stable(path).await
}
