//! Camvault service main entry point
//!
//! Runs the encryption loop, upload loop, retention sweeper and playback
//! server, or a single pass of one of them.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use camvault::{
    config::VaultConfig,
    error::Result,
    keys::KeyMaterial,
    pump::ScanReport,
    server,
    service::{self, Store, VaultService},
};

/// Camvault service command line interface
#[derive(Parser)]
#[command(name = "camvault")]
#[command(about = "Encrypts camera segments into daily containers, uploads them and serves playback")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled loop until SIGINT or SIGTERM
    Run,

    /// Encrypt the stable segments currently in the raw directory, once
    Encrypt,

    /// Upload the containers currently in the encrypted directory, once
    Upload,

    /// Run only the playback server
    Serve,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Create the key file if it does not exist
    Keygen,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = initialize_logging(&cli, &config) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(config).await,
        Commands::Encrypt => encrypt_once(config).await,
        Commands::Upload => upload_once(config).await,
        Commands::Serve => serve(config).await,
        Commands::Config { show } => handle_config(config, show),
        Commands::Keygen => keygen(config),
    };

    if let Err(e) = result {
        error!("Command failed ({}): {}", e.category(), e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<VaultConfig> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => VaultConfig::default_config_path().ok(),
    };
    Ok(VaultConfig::load_with_fallback(path)?)
}

/// Initialize logging from the command line and configuration
fn initialize_logging(cli: &Cli, config: &VaultConfig) -> Result<()> {
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level).to_lowercase();
    let directive = format!("camvault={}", level)
        .parse()
        .map_err(|e| format!("invalid log level {}: {}", level, e))?;

    let filter = EnvFilter::from_default_env()
        .add_directive(directive)
        .add_directive("tower_http=info".parse().map_err(|e| format!("{}", e))?)
        .add_directive("hyper=warn".parse().map_err(|e| format!("{}", e))?);

    if cli.json_logs || config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl-C");
    }
    Ok(())
}

/// Forward the first shutdown signal to every subscriber
fn forward_shutdown(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Signal handling failed: {}", e);
        }
        let _ = shutdown.send(());
    });
}

async fn run_service(config: VaultConfig) -> Result<()> {
    info!("Starting camvault service");
    let service = VaultService::new(config);
    forward_shutdown(service.shutdown_handle());
    service.run().await
}

fn print_report(stage: &str, report: &ScanReport) {
    println!("{} pass completed:", stage);
    println!("  Files listed: {}", report.listed);
    println!("  Consumed: {}", report.consumed);
    println!("  Retained: {}", report.retained);
    println!("  Still growing: {}", report.unstable);
    println!("  Failed: {}", report.failed);
}

async fn encrypt_once(config: VaultConfig) -> Result<()> {
    let key = service::load_key(&config)?;
    let mut pump = service::encrypt_pump(&config, key)?;
    let report = pump.scan_once().await?;
    print_report("Encryption", &report);
    Ok(())
}

async fn upload_once(config: VaultConfig) -> Result<()> {
    let store = Store::open(&config)?;
    let mut pump = service::upload_pump(&config, &store)?;
    let report = pump.scan_once().await?;
    print_report("Upload", &report);
    Ok(())
}

async fn serve(config: VaultConfig) -> Result<()> {
    let key = service::load_key(&config)?;
    let store = Store::open(&config)?;
    let state = service::playback_state(&config, key, &store)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    forward_shutdown(shutdown_tx);
    server::serve(state, service::bind_address(&config)?, shutdown_rx).await
}

fn handle_config(config: VaultConfig, show: bool) -> Result<()> {
    if show {
        let rendered = toml::to_string_pretty(&config).map_err(|e| format!("unable to render configuration: {}", e))?;
        println!("Effective configuration:");
        println!("{}", rendered);
    } else {
        config.validate()?;
        println!("Configuration is valid");
    }
    Ok(())
}

fn keygen(config: VaultConfig) -> Result<()> {
    let path = &config.storage.key_path;
    let (key, created) = KeyMaterial::load_or_generate(path)?;
    if created {
        println!("Created key {} at {}", key.fingerprint(), path.display());
    } else {
        println!("Key {} already exists at {}", key.fingerprint(), path.display());
    }
    Ok(())
}
