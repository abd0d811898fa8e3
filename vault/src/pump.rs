//! Directory polling loop
//!
//! A `DirectoryPump` lists a directory, keeps files with the configured
//! extension, waits for each one to be stable and hands it to a
//! `SegmentProcessor`. Both the encryption stage and the upload stage run on
//! it. Files are processed one at a time in lexicographic order.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
#[cfg(feature = "metrics")]
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{Result, VaultError};
use crate::fsutil;
#[cfg(feature = "metrics")]
use crate::metrics::VaultMetrics;
use crate::stability::{Stability, StabilityDetector};

/// What a processor did with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Durably handled; the pump deletes the source
    Consumed,
    /// Durably handled, but the file must stay in place
    Retained,
}

/// A blocking per-file stage driven by a `DirectoryPump`
pub trait SegmentProcessor: Send + 'static {
    /// Stage name for logs
    fn name(&self) -> &'static str;

    /// Process one stable file. Errors leave the file for the next scan.
    fn process(&mut self, path: &Path) -> Result<Outcome>;
}

/// Counts from a single directory scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub listed: usize,
    pub unstable: usize,
    pub vanished: usize,
    pub consumed: usize,
    pub retained: usize,
    pub failed: usize,
}

/// Polls one directory and feeds stable files to a processor
pub struct DirectoryPump<P> {
    dir: PathBuf,
    extension: String,
    detector: StabilityDetector,
    interval: Duration,
    processor: Option<P>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<VaultMetrics>>,
}

impl<P: SegmentProcessor> DirectoryPump<P> {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: &str,
        detector: StabilityDetector,
        interval: Duration,
        processor: P,
    ) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
            detector,
            interval,
            processor: Some(processor),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Count every scan's outcomes in `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<VaultMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The processor, unless a panic inside it was caught
    pub fn processor(&self) -> Option<&P> {
        self.processor.as_ref()
    }

    /// Matching regular files in lexicographic order
    pub fn list_candidates(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let matches = path.extension().and_then(OsStr::to_str) == Some(self.extension.as_str());
            if matches && entry.file_type()?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn stage(&self) -> &'static str {
        self.processor.as_ref().map(|p| p.name()).unwrap_or("pump")
    }

    /// Run one scan. Listing errors are returned; per-file errors are
    /// logged, counted and swallowed.
    pub async fn scan_once(&mut self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let candidates = self.list_candidates()?;
        report.listed = candidates.len();

        for path in candidates {
            let stage = self.stage();

            match self.detector.check(&path).await {
                Stability::Stable { .. } => {}
                Stability::Growing { before, after } => {
                    debug!("[{}] {} still growing ({} -> {} bytes)", stage, path.display(), before, after);
                    report.unstable += 1;
                    continue;
                }
                Stability::Vanished => {
                    debug!("[{}] {} disappeared before processing", stage, path.display());
                    report.vanished += 1;
                    continue;
                }
            }

            match self.process_blocking(path.clone()).await? {
                Ok(Outcome::Consumed) => {
                    if let Err(e) = fsutil::remove_if_exists(&path) {
                        warn!("[{}] Processed {} but could not delete it: {}", stage, path.display(), e);
                    }
                    info!("[{}] Consumed {}", stage, path.display());
                    report.consumed += 1;
                }
                Ok(Outcome::Retained) => {
                    debug!("[{}] Retained {}", stage, path.display());
                    report.retained += 1;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("[{}] Failed to process {} ({}): {}", stage, path.display(), e.category(), e);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("[{}] Failed to process {} ({}): {}", stage, path.display(), e.category(), e);
                    report.failed += 1;
                }
            }
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_scan(self.stage(), &report);
        }
        Ok(report)
    }

    /// Move the processor onto the blocking pool for one file and back.
    async fn process_blocking(&mut self, path: PathBuf) -> Result<Result<Outcome>> {
        let mut processor = self
            .processor
            .take()
            .ok_or_else(|| VaultError::Generic("processor lost after a panic".to_string()))?;

        let joined = tokio::task::spawn_blocking(move || {
            let outcome = processor.process(&path);
            (processor, outcome)
        })
        .await;

        match joined {
            Ok((processor, outcome)) => {
                self.processor = Some(processor);
                Ok(outcome)
            }
            Err(e) => Err(VaultError::Generic(format!("processor task failed: {}", e))),
        }
    }

    /// Scan until a shutdown signal arrives, sleeping between scans.
    ///
    /// A scan in progress finishes its current file before shutdown is seen.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let stage = self.stage();
        info!("[{}] Watching {} for .{} files", stage, self.dir.display(), self.extension);

        loop {
            match self.scan_once().await {
                Ok(report) if report.consumed + report.retained + report.failed > 0 => {
                    info!(
                        "[{}] Scan done: {} consumed, {} retained, {} failed, {} unstable",
                        stage, report.consumed, report.retained, report.failed, report.unstable
                    );
                }
                Ok(_) => {}
                Err(e) if self.processor.is_none() => {
                    error!("[{}] Stopping: {}", stage, e);
                    return Err(e);
                }
                Err(e) => warn!("[{}] Scan of {} failed: {}", stage, self.dir.display(), e),
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!("[{}] Received shutdown signal", stage);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default, Clone)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        retain: HashSet<String>,
        fail: HashSet<String>,
    }

    impl SegmentProcessor for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn process(&mut self, path: &Path) -> Result<Outcome> {
            let name = file_name(path);
            self.seen.lock().unwrap().push(name.clone());
            if self.fail.contains(&name) {
                return Err(VaultError::Generic("boom".to_string()));
            }
            if self.retain.contains(&name) {
                return Ok(Outcome::Retained);
            }
            Ok(Outcome::Consumed)
        }
    }

    fn file_name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().to_string()
    }

    fn pump(dir: &Path, recorder: Recorder) -> DirectoryPump<Recorder> {
        DirectoryPump::new(
            dir,
            "mp4",
            StabilityDetector::new(Duration::from_millis(10)),
            Duration::from_millis(10),
            recorder,
        )
    }

    #[tokio::test]
    async fn test_processes_in_lexicographic_order() {
        let dir = tempdir().unwrap();
        for name in ["b.mp4", "a.mp4", "c.mp4", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let recorder = Recorder::default();
        let seen = recorder.seen.clone();

        let report = pump(dir.path(), recorder).scan_once().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a.mp4", "b.mp4", "c.mp4"]);
        assert_eq!(report.consumed, 3);
        assert!(!dir.path().join("a.mp4").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_scan_counts_reach_metrics() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        let metrics = Arc::new(VaultMetrics::new().unwrap());

        let mut p = pump(dir.path(), Recorder::default()).with_metrics(metrics.clone());
        p.scan_once().await.unwrap();

        let text = metrics.render().unwrap();
        assert!(text.contains("stage=\"recorder\""));
        assert!(text.contains("outcome=\"consumed\""));
    }

    #[tokio::test]
    async fn test_failed_and_retained_files_stay() {
        let dir = tempdir().unwrap();
        for name in ["bad.mp4", "keep.mp4", "ok.mp4"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let mut recorder = Recorder::default();
        recorder.fail.insert("bad.mp4".to_string());
        recorder.retain.insert("keep.mp4".to_string());

        let report = pump(dir.path(), recorder).scan_once().await.unwrap();

        assert_eq!((report.consumed, report.retained, report.failed), (1, 1, 1));
        assert!(dir.path().join("bad.mp4").exists());
        assert!(dir.path().join("keep.mp4").exists());
        assert!(!dir.path().join("ok.mp4").exists());
    }

    #[tokio::test]
    async fn test_growing_file_is_left_for_next_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.mp4");
        fs::write(&path, b"x").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for _ in 0..20 {
                let mut bytes = fs::read(&writer_path).unwrap();
                bytes.push(b'y');
                fs::write(&writer_path, bytes).unwrap();
                sleep(Duration::from_millis(5)).await;
            }
        });

        let recorder = Recorder::default();
        let seen = recorder.seen.clone();
        let mut p = DirectoryPump::new(
            dir.path(),
            "mp4",
            StabilityDetector::new(Duration::from_millis(40)),
            Duration::from_millis(10),
            recorder,
        );
        let report = p.scan_once().await.unwrap();
        writer.await.unwrap();

        assert_eq!(report.unstable, 1);
        assert!(seen.lock().unwrap().is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_scan_error() {
        let dir = tempdir().unwrap();
        let mut p = pump(&dir.path().join("missing"), Recorder::default());
        assert!(p.scan_once().await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(pump(dir.path(), Recorder::default()).run(rx));

        sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
