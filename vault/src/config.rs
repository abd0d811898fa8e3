//! Configuration management for the camvault service
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and `CAMVAULT_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Main configuration structure for the vault service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory and key locations
    pub storage: StorageConfig,

    /// Encryption loop configuration
    pub pipeline: PipelineConfig,

    /// Upload loop configuration
    pub upload: UploadConfig,

    /// Blob sink and index configuration
    pub sink: SinkConfig,

    /// Playback server configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Storage related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory the camera drops finished segments into
    pub raw_dir: PathBuf,

    /// Directory holding the daily containers
    pub encrypted_dir: PathBuf,

    /// Path of the raw 32-byte key file
    pub key_path: PathBuf,

    /// Path of the processed-source log
    pub processed_log_path: PathBuf,

    /// Generate the key on first run when it is absent
    pub generate_key_if_missing: bool,
}

/// Encryption loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Enable the encryption loop
    pub enabled: bool,

    /// Camera identifier written into every day header
    pub camera_id: String,

    /// Extension of source segments, without the dot
    pub source_extension: String,

    /// Extension of daily containers, without the dot
    pub container_extension: String,

    /// Seconds to sleep between directory scans
    pub scan_interval_secs: u64,

    /// Milliseconds a file size must stay unchanged before it is consumed
    pub quiet_period_ms: u64,
}

/// Upload loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Enable the upload loop
    pub enabled: bool,

    /// Seconds to sleep between directory scans
    pub scan_interval_secs: u64,

    /// Milliseconds a container size must stay unchanged before upload
    pub quiet_period_ms: u64,
}

/// Blob sink and metadata index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Root directory of the object store and index
    pub base_path: PathBuf,

    /// Days an uploaded video stays in the index
    pub retention_days: u32,

    /// Seconds between retention sweeps
    pub purge_interval_secs: u64,
}

/// Playback server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Enable the playback server
    pub enabled: bool,

    /// Address to bind
    pub bind_address: String,

    /// Port to bind
    pub port: u16,

    /// Directory for decrypted range artifacts
    pub temp_dir: PathBuf,

    /// Size of each streamed piece in bytes
    pub stream_piece_size: usize,

    /// Offset applied to search dates and times, in minutes east of UTC
    pub utc_offset_minutes: i32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Emit JSON formatted logs
    pub json: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")))
        .join("camvault")
}

impl StorageConfig {
    fn under(base: &Path) -> Self {
        Self {
            raw_dir: base.join("raw"),
            encrypted_dir: base.join("encrypted"),
            key_path: base.join("secret.key"),
            processed_log_path: base.join("processed_log.json"),
            generate_key_if_missing: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::under(&default_data_dir())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            camera_id: "cam_01".to_string(),
            source_extension: "mp4".to_string(),
            container_extension: "container".to_string(),
            scan_interval_secs: 10,
            quiet_period_ms: 3000,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 60,
            quiet_period_ms: 3000,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            base_path: default_data_dir().join("sink"),
            retention_days: 7,
            purge_interval_secs: 3600,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            port: 5000,
            temp_dir: default_data_dir().join("tmp"),
            stream_piece_size: 64 * 1024,
            utc_offset_minutes: 330,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

impl UploadConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

impl SinkConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl VaultConfig {
    /// Build a configuration with every path placed under `base`
    pub fn with_base_dir<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        let mut config = VaultConfig::default();
        config.storage = StorageConfig::under(base);
        config.sink.base_path = base.join("sink");
        config.server.temp_dir = base.join("tmp");
        config
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: VaultConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = VaultConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CAMVAULT_*` environment variables
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Ok(data_dir) = std::env::var("CAMVAULT_DATA_DIR") {
            let base = PathBuf::from(data_dir);
            self.storage = StorageConfig::under(&base);
            self.sink.base_path = base.join("sink");
            self.server.temp_dir = base.join("tmp");
        }

        if let Ok(key_path) = std::env::var("CAMVAULT_KEY_PATH") {
            self.storage.key_path = PathBuf::from(key_path);
        }

        if let Ok(camera_id) = std::env::var("CAMVAULT_CAMERA_ID") {
            self.pipeline.camera_id = camera_id;
        }

        if let Ok(interval) = std::env::var("CAMVAULT_SCAN_INTERVAL") {
            self.pipeline.scan_interval_secs = interval.parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "CAMVAULT_SCAN_INTERVAL".to_string(),
                    value: interval,
                })?;
        }

        if let Ok(port) = std::env::var("CAMVAULT_PORT") {
            self.server.port = port.parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "CAMVAULT_PORT".to_string(),
                    value: port,
                })?;
        }

        if let Ok(retention) = std::env::var("CAMVAULT_RETENTION_DAYS") {
            self.sink.retention_days = retention.parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "CAMVAULT_RETENTION_DAYS".to_string(),
                    value: retention,
                })?;
        }

        if let Ok(log_level) = std::env::var("CAMVAULT_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = VaultConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = VaultConfig::from_file(path)?;
            }
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pipeline.camera_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.camera_id".to_string(),
                value: self.pipeline.camera_id.clone(),
            });
        }

        for (field, ext) in [
            ("pipeline.source_extension", &self.pipeline.source_extension),
            ("pipeline.container_extension", &self.pipeline.container_extension),
        ] {
            if ext.is_empty() || ext.contains('.') || ext.contains('/') {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: ext.clone(),
                });
            }
        }

        if self.pipeline.source_extension == self.pipeline.container_extension {
            return Err(ConfigError::ValidationFailed {
                reason: "source and container extensions must differ".to_string(),
            });
        }

        if self.pipeline.scan_interval_secs == 0 || self.upload.scan_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan_interval_secs".to_string(),
                value: "0".to_string(),
            });
        }

        if self.sink.retention_days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sink.retention_days".to_string(),
                value: "0".to_string(),
            });
        }

        if self.server.stream_piece_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.stream_piece_size".to_string(),
                value: "0".to_string(),
            });
        }

        if self.server.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::InvalidValue {
                field: "server.utc_offset_minutes".to_string(),
                value: self.server.utc_offset_minutes.to_string(),
            });
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("camvault").join("camvault.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|_| ConfigError::ValidationFailed {
                    reason: format!("Unable to create config directory: {}", parent.display()),
                })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content)
            .map_err(|e| ConfigError::ValidationFailed {
                reason: format!("Unable to write {}: {}", path.display(), e),
            })?;

        Ok(())
    }
}
