//! Service wiring: builds each loop from the configuration and supervises them
//!
//! The encryption loop, upload loop, retention sweeper and playback server
//! share no in-memory state. They are started as separate tasks, stop on a
//! common broadcast shutdown signal, and a loop that cannot start only takes
//! itself down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::DayClock;
use crate::config::VaultConfig;
use crate::container::ContainerWriter;
use crate::crypto::ChunkEncryptor;
use crate::error::{ConfigError, Result};
use crate::keys::KeyMaterial;
#[cfg(feature = "metrics")]
use crate::metrics::VaultMetrics;
use crate::pipeline::EncryptStage;
use crate::playback::{sweep_stale_artifacts, RangeStreamReader};
use crate::pump::DirectoryPump;
use crate::retention::RetentionSweeper;
use crate::server::{self, AppState};
use crate::sink::{sweep_staging, FileIndex, FileSink};
use crate::stability::StabilityDetector;
use crate::uploader::ContainerUploader;

/// Index file name under the sink's base path
pub const INDEX_FILE: &str = "index.json";

/// Load the deployment key, generating it first if the configuration allows
pub fn load_key(config: &VaultConfig) -> Result<Arc<KeyMaterial>> {
    let path = &config.storage.key_path;
    let key = if config.storage.generate_key_if_missing {
        let (key, created) = KeyMaterial::load_or_generate(path)?;
        if created {
            info!("Created key {} at {}", key.fingerprint(), path.display());
        }
        key
    } else {
        KeyMaterial::load(path)?
    };
    Ok(Arc::new(key))
}

/// The filesystem sink and its metadata index
#[derive(Clone)]
pub struct Store {
    pub sink: Arc<FileSink>,
    pub index: Arc<FileIndex>,
}

impl Store {
    pub fn open(config: &VaultConfig) -> Result<Self> {
        let sink = FileSink::open(&config.sink.base_path)?;
        let index = FileIndex::open(config.sink.base_path.join(INDEX_FILE), config.sink.retention())?;

        let removed = sweep_staging(&sink);
        if removed > 0 {
            warn!("Removed {} interrupted uploads from staging", removed);
        }
        Ok(Self { sink: Arc::new(sink), index: Arc::new(index) })
    }
}

/// Pump that encrypts raw segments into today's container
pub fn encrypt_pump(config: &VaultConfig, key: Arc<KeyMaterial>) -> Result<DirectoryPump<EncryptStage>> {
    let storage = &config.storage;
    let pipeline = &config.pipeline;
    std::fs::create_dir_all(&storage.raw_dir)?;

    let writer = ContainerWriter::open(
        &storage.encrypted_dir,
        &pipeline.container_extension,
        &pipeline.camera_id,
        &storage.processed_log_path,
    )?;
    let stage = EncryptStage::new(ChunkEncryptor::new(key), writer, DayClock::Local);

    Ok(DirectoryPump::new(
        &storage.raw_dir,
        &pipeline.source_extension,
        StabilityDetector::new(pipeline.quiet_period()),
        pipeline.scan_interval(),
        stage,
    ))
}

/// Pump that uploads containers to the sink
pub fn upload_pump(config: &VaultConfig, store: &Store) -> Result<DirectoryPump<ContainerUploader>> {
    std::fs::create_dir_all(&config.storage.encrypted_dir)?;
    let uploader = ContainerUploader::new(store.sink.clone(), store.index.clone(), DayClock::Local);

    Ok(DirectoryPump::new(
        &config.storage.encrypted_dir,
        &config.pipeline.container_extension,
        StabilityDetector::new(config.upload.quiet_period()),
        config.upload.scan_interval(),
        uploader,
    ))
}

/// Handler state for the playback server
pub fn playback_state(config: &VaultConfig, key: Arc<KeyMaterial>, store: &Store) -> Result<AppState> {
    let server = &config.server;
    std::fs::create_dir_all(&server.temp_dir)?;
    let stale = sweep_stale_artifacts(&server.temp_dir);
    if stale > 0 {
        info!("Removed {} stale playback artifacts", stale);
    }

    let reader = RangeStreamReader::new(key, store.sink.clone(), server.temp_dir.clone(), server.stream_piece_size);
    Ok(AppState::new(
        reader,
        store.index.clone(),
        config.storage.encrypted_dir.clone(),
        &config.pipeline.container_extension,
        server.utc_offset_minutes,
    ))
}

/// Socket address the playback server binds
pub fn bind_address(config: &VaultConfig) -> Result<SocketAddr> {
    let raw = format!("{}:{}", config.server.bind_address, config.server.port);
    let addr = raw.parse().map_err(|_| ConfigError::InvalidValue {
        field: "server.bind_address".to_string(),
        value: raw.clone(),
    })?;
    Ok(addr)
}

/// Runs every enabled loop until shutdown
pub struct VaultService {
    config: VaultConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl VaultService {
    pub fn new(config: VaultConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { config, shutdown_tx }
    }

    /// Sender that stops every loop when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start the enabled loops and wait for all of them to finish
    pub async fn run(&self) -> Result<()> {
        let config = &self.config;
        let mut loops: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();
        #[cfg(feature = "metrics")]
        let metrics = Arc::new(VaultMetrics::new()?);

        let store = match Store::open(config) {
            Ok(store) => Some(store),
            Err(e) => {
                error!("Sink unavailable, upload, retention and playback will not start: {}", e);
                None
            }
        };

        if config.pipeline.enabled {
            let config = config.clone();
            let shutdown = self.shutdown_tx.subscribe();
            #[cfg(feature = "metrics")]
            let metrics = metrics.clone();
            loops.push((
                "encrypt",
                tokio::spawn(async move {
                    let key = load_key(&config)?;
                    info!("Encrypting with key {}", key.fingerprint());
                    let pump = encrypt_pump(&config, key)?;
                    #[cfg(feature = "metrics")]
                    let pump = pump.with_metrics(metrics);
                    pump.run(shutdown).await
                }),
            ));
        }

        if let Some(store) = store {
            if config.upload.enabled {
                let pump = upload_pump(config, &store);
                #[cfg(feature = "metrics")]
                let pump = pump.map(|pump| pump.with_metrics(metrics.clone()));
                let shutdown = self.shutdown_tx.subscribe();
                loops.push(("upload", tokio::spawn(async move { pump?.run(shutdown).await })));
            }

            let sweeper = RetentionSweeper::new(store.index.clone(), store.sink.clone(), config.sink.purge_interval());
            loops.push(("retention", tokio::spawn(sweeper.run(self.shutdown_tx.subscribe()))));

            if config.server.enabled {
                let config = config.clone();
                let shutdown = self.shutdown_tx.subscribe();
                #[cfg(feature = "metrics")]
                let metrics = metrics.clone();
                loops.push((
                    "server",
                    tokio::spawn(async move {
                        let key = load_key(&config)?;
                        let state = playback_state(&config, key, &store)?;
                        #[cfg(feature = "metrics")]
                        let state = state.with_metrics(metrics);
                        server::serve(state, bind_address(&config)?, shutdown).await
                    }),
                ));
            }
        }

        if loops.is_empty() {
            warn!("No loops enabled, nothing to run");
            return Ok(());
        }

        info!("Camvault service started ({} loops)", loops.len());
        for (name, handle) in loops {
            match handle.await {
                Ok(Ok(())) => info!("[{}] stopped", name),
                Ok(Err(e)) => error!("[{}] stopped with error ({}): {}", name, e.category(), e),
                Err(e) => error!("[{}] task failed: {}", name, e),
            }
        }
        info!("Camvault service stopped");
        Ok(())
    }
}
