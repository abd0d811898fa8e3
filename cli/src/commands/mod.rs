pub mod decrypt;
pub mod inspect;
pub mod keygen;
pub mod search;

pub use decrypt::{DecryptArgs, DecryptBlobArgs};
pub use inspect::InspectArgs;
pub use keygen::KeygenArgs;
pub use search::SearchArgs;

use std::path::PathBuf;
use std::sync::Arc;

use camvault::config::VaultConfig;
use camvault::keys::KeyMaterial;

use crate::error::Result;

/// Settings every command resolves the same way
pub struct Context {
    pub config: VaultConfig,
    /// `--key`, falling back to `storage.key_path`
    pub key_path: PathBuf,
}

impl Context {
    pub fn new(config: VaultConfig, key_override: Option<PathBuf>) -> Self {
        let key_path = key_override.unwrap_or_else(|| config.storage.key_path.clone());
        Self { config, key_path }
    }

    /// Load the existing key; commands that read data never create one
    pub fn load_key(&self) -> Result<Arc<KeyMaterial>> {
        Ok(Arc::new(KeyMaterial::load(&self.key_path)?))
    }
}
