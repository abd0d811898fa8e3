//! Key material for the vault
//!
//! One 32-byte symmetric key per deployment, stored raw in a file readable
//! only by its owner. The daemon generates it on first run; every other
//! component loads it read-only and fails with `KeyMissing` when it is absent.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use rand::RngCore;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// Length of the symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// The deployment's symmetric key, wiped from memory on drop
pub struct KeyMaterial {
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl KeyMaterial {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
        Self { bytes }
    }

    /// Build a key from raw bytes
    pub fn from_bytes(raw: &[u8]) -> CryptoResult<Self> {
        if raw.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength { expected: KEY_LEN, actual: raw.len() });
        }
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        bytes.copy_from_slice(raw);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Load the key file, failing with `KeyMissing` if it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> CryptoResult<Self> {
        let path = path.as_ref();
        let raw = Zeroizing::new(fs::read(path).map_err(|_| CryptoError::KeyMissing {
            path: path.display().to_string(),
        })?);
        Self::from_bytes(&raw)
    }

    /// Load the key file, generating and persisting a new key when absent.
    ///
    /// Returns the key and whether it was newly created.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> CryptoResult<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }

        let key = Self::generate();
        match key.persist(path) {
            Ok(()) => {
                info!("Generated new key at {}", path.display());
                Ok((key, true))
            }
            // Another process won the race; use its key.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok((Self::load(path)?, false)),
            Err(e) => Err(CryptoError::EncryptionFailed {
                reason: format!("unable to write key file {}: {}", path.display(), e),
            }),
        }
    }

    /// Write the key to a new file with owner-only permissions
    pub fn persist<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(&self.bytes[..])?;
        file.sync_all()
    }

    /// Short fingerprint for logs, never the key itself
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.bytes[..]).as_bytes()[..4])
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").field("fingerprint", &self.fingerprint()).finish()
    }
}
