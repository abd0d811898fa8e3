//! Prometheus counters for the directory pumps and playback
//!
//! One registry per service. Pumps add their scan counts after every scan and
//! the playback server renders the registry on `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{MetricsError, MetricsResult};
use crate::pump::ScanReport;

/// Counters shared by every loop of one service
#[derive(Clone)]
pub struct VaultMetrics {
    registry: Registry,
    pump_files: IntCounterVec,
    integrity_failures: IntCounter,
}

impl VaultMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let pump_files = IntCounterVec::new(
            Opts::new("camvault_pump_files_total", "Files handled by a directory pump, by outcome"),
            &["stage", "outcome"],
        )
        .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
        registry
            .register(Box::new(pump_files.clone()))
            .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;

        let integrity_failures = IntCounter::new(
            "camvault_playback_integrity_failures_total",
            "Playback requests refused because stored ciphertext failed authentication",
        )
        .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;
        registry
            .register(Box::new(integrity_failures.clone()))
            .map_err(|e| MetricsError::RegistrationFailed { name: e.to_string() })?;

        Ok(Self { registry, pump_files, integrity_failures })
    }

    /// Add one scan's counts under `stage`
    pub fn record_scan(&self, stage: &str, report: &ScanReport) {
        for (outcome, count) in [
            ("consumed", report.consumed),
            ("retained", report.retained),
            ("failed", report.failed),
            ("unstable", report.unstable),
        ] {
            if count > 0 {
                self.pump_files.with_label_values(&[stage, outcome]).inc_by(count as u64);
            }
        }
    }

    pub fn record_integrity_failure(&self) {
        self.integrity_failures.inc();
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> MetricsResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })?;
        String::from_utf8(buffer).map_err(|e| MetricsError::ExportFailed { reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_counts_accumulate() {
        let metrics = VaultMetrics::new().unwrap();
        let report = ScanReport { listed: 4, consumed: 2, retained: 1, failed: 1, ..ScanReport::default() };
        metrics.record_scan("encrypt", &report);
        metrics.record_scan("encrypt", &report);
        metrics.record_scan("upload", &ScanReport { consumed: 1, ..ScanReport::default() });

        assert_eq!(metrics.pump_files.with_label_values(&["encrypt", "consumed"]).get(), 4);
        assert_eq!(metrics.pump_files.with_label_values(&["encrypt", "failed"]).get(), 2);
        assert_eq!(metrics.pump_files.with_label_values(&["upload", "consumed"]).get(), 1);

        assert_eq!(metrics.pump_files.with_label_values(&["upload", "failed"]).get(), 0);

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE camvault_pump_files_total counter"));
        assert!(text.contains("stage=\"upload\""));
    }

    #[test]
    fn test_integrity_failures_are_counted() {
        let metrics = VaultMetrics::new().unwrap();
        metrics.record_integrity_failure();
        assert!(metrics.render().unwrap().contains("camvault_playback_integrity_failures_total 1"));
    }
}
