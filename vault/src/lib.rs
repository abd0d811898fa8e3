//! Camvault: encrypted at-rest storage for continuous camera footage
//!
//! Finished video segments dropped into a raw directory are encrypted one by
//! one with AES-256-GCM and appended to a per-day container file. An upload
//! loop copies every chunk of those containers into a write-once blob sink
//! with a metadata index, and an HTTP server decrypts stored chunks on demand
//! with byte-range support.
//!
//! Container layout:
//! ```text
//! [u32 BE len][day header JSON]
//! [u32 BE len][chunk header JSON][16B nonce][16B tag][ciphertext]
//! [u32 BE len][chunk header JSON][16B nonce][16B tag][ciphertext]
//! ...
//! ```

pub mod clock;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod format;
pub mod fsutil;
pub mod keys;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pipeline;
pub mod playback;
pub mod pump;
pub mod retention;
pub mod server;
pub mod service;
pub mod sink;
pub mod stability;
pub mod uploader;

// Re-export commonly used types
pub use config::VaultConfig;
pub use container::{ContainerWriter, ProcessedLog};
pub use crypto::{ChunkDecryptor, ChunkEncryptor};
pub use error::{Result, VaultError};
pub use format::{ChunkHeader, ChunkRecord, ContainerReader, DayHeader, LegacyBlob};
pub use keys::KeyMaterial;
pub use playback::{ByteRange, RangeStreamReader, Source};
pub use pump::{DirectoryPump, Outcome, SegmentProcessor};
pub use service::VaultService;
pub use sink::{BlobSink, FileIndex, FileSink, MetadataIndex, StorageHandle, VideoMetadata, VideoQuery};
pub use stability::StabilityDetector;
