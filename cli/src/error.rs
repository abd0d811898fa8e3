use camvault::error::{ConfigError, ContainerError, CryptoError, SinkError, VaultError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Vault(#[from] VaultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Chunk {filename} at offset {offset} failed authentication after {written} chunks were written")]
    CorruptChunk { filename: String, offset: u64, written: usize },
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Vault(err.into())
    }
}

impl From<CryptoError> for CliError {
    fn from(err: CryptoError) -> Self {
        CliError::Vault(err.into())
    }
}

impl From<ContainerError> for CliError {
    fn from(err: ContainerError) -> Self {
        CliError::Vault(err.into())
    }
}

impl From<SinkError> for CliError {
    fn from(err: SinkError) -> Self {
        CliError::Vault(err.into())
    }
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Vault(VaultError::Config(_)) => 1,
            CliError::Io(_) => 2,
            CliError::Vault(VaultError::Crypto(CryptoError::KeyMissing { .. })) => 3,
            CliError::FileNotFound { .. } => 5,
            CliError::InvalidArgument(_) => 6,
            CliError::CorruptChunk { .. } => 7,
            CliError::Vault(VaultError::Crypto(CryptoError::IntegrityFailure)) => 7,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Format error for user-friendly display
pub fn format_error(error: &CliError) -> String {
    match error {
        CliError::Vault(VaultError::Config(e)) => {
            format!("Configuration Error: {}\n\nCheck the file passed with --config.", e)
        }
        CliError::Vault(VaultError::Crypto(CryptoError::KeyMissing { path })) => {
            format!("Key Not Found: {}\n\nRun 'vaultctl keygen' or pass the right file with --key.", path)
        }
        CliError::Vault(VaultError::Crypto(CryptoError::IntegrityFailure)) => {
            "Integrity Failure: the data was not encrypted with this key or has been modified.".to_string()
        }
        CliError::FileNotFound { path } => {
            format!("File Not Found: {}\n\nPlease check that the file exists and is accessible.", path)
        }
        CliError::CorruptChunk { .. } => {
            format!("{}\n\nEarlier chunks were decrypted; later chunks were not attempted.", error)
        }
        _ => error.to_string(),
    }
}
