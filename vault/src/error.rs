//! Error handling for the camvault service
//!
//! This module provides the error types for every vault operation: container
//! framing, chunk encryption, configuration, the blob sink and playback ranges.

use std::io;

use thiserror::Error;

/// The main error type for the vault service
#[derive(Error, Debug)]
pub enum VaultError {
    /// Container framing errors
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// Encryption and key errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Blob sink and metadata index errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Playback range errors
    #[error("Range error: {0}")]
    Range(#[from] RangeError),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// The source file was still growing when it was checked
    #[error("Source file is still being written: {path}")]
    UnstableSource { path: String },

    /// The source file is already folded into the day's container
    #[error("Source {filename} already stored in container for {day}")]
    DuplicateSource { day: String, filename: String },

    /// The requested container or chunk does not exist
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Container framing errors
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Container has no day header")]
    MissingDayHeader,

    #[error("Truncated container tail at offset {offset} after {chunks_decoded} chunks")]
    Truncated { offset: u64, chunks_decoded: usize },

    #[error("Corrupt header at offset {offset}: {reason}")]
    CorruptHeader { offset: u64, reason: String },

    #[error("Header at offset {offset} declares {len} bytes")]
    HeaderTooLarge { offset: u64, len: u32 },

    #[error("Unsupported cipher suite: {suite}")]
    UnsupportedSuite { suite: String },

    #[error("No chunk starts at offset {offset}")]
    NoChunkAtOffset { offset: u64 },
}

/// Encryption and key errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Authentication tag verification failed")]
    IntegrityFailure,

    #[error("Key file not found: {path}")]
    KeyMissing { path: String },

    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    #[error("Encrypted blob too short: {len} bytes")]
    BlobTooShort { len: usize },
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Blob sink and metadata index errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Object not found: {handle}")]
    NotFound { handle: String },

    #[error("Invalid storage handle: {handle}")]
    InvalidHandle { handle: String },

    #[error("Metadata index corrupted: {reason}")]
    IndexCorrupted { reason: String },
}

/// Metrics registry errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to register metric: {name}")]
    RegistrationFailed { name: String },

    #[error("Failed to export metrics: {reason}")]
    ExportFailed { reason: String },
}

/// Playback range errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Malformed range header: {header}")]
    Malformed { header: String },

    #[error("Range start {start} not satisfiable for {total} bytes")]
    Unsatisfiable { start: u64, total: u64 },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, VaultError>;

/// A specialized result type for container operations
pub type ContainerResult<T> = std::result::Result<T, ContainerError>;

/// A specialized result type for crypto operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// A specialized result type for metrics operations
pub type MetricsResult<T> = std::result::Result<T, MetricsError>;

/// A specialized result type for range parsing
pub type RangeResult<T> = std::result::Result<T, RangeError>;

impl VaultError {
    /// Check if the failed operation may succeed on a later scan
    pub fn is_recoverable(&self) -> bool {
        match self {
            VaultError::UnstableSource { .. } => true,
            VaultError::DuplicateSource { .. } => true,
            VaultError::Sink(SinkError::Unavailable { .. }) => true,
            VaultError::Container(ContainerError::Truncated { .. }) => true,
            VaultError::Crypto(CryptoError::IntegrityFailure) => false,
            VaultError::Crypto(CryptoError::KeyMissing { .. }) => false,
            VaultError::Crypto(CryptoError::InvalidKeyLength { .. }) => false,
            VaultError::Config(_) => false,
            VaultError::Io(io_error) => !matches!(
                io_error.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported
            ),
            _ => true,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            VaultError::Container(_) => "container",
            VaultError::Crypto(_) => "crypto",
            VaultError::Config(_) => "config",
            VaultError::Sink(_) => "sink",
            VaultError::Range(_) => "range",
            VaultError::Metrics(_) => "metrics",
            VaultError::UnstableSource { .. } => "unstable_source",
            VaultError::DuplicateSource { .. } => "duplicate_source",
            VaultError::NotFound { .. } => "not_found",
            VaultError::Io(_) => "io",
            VaultError::Serialization(_) => "serialization",
            VaultError::Generic(_) => "generic",
        }
    }

    /// True when the error is an authentication failure on stored ciphertext
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, VaultError::Crypto(CryptoError::IntegrityFailure))
    }
}

impl From<String> for VaultError {
    fn from(msg: String) -> Self {
        VaultError::Generic(msg)
    }
}

impl From<&str> for VaultError {
    fn from(msg: &str) -> Self {
        VaultError::Generic(msg.to_string())
    }
}

impl From<VaultError> for io::Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Io(io_error) => io_error,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
