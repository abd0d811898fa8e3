use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod error;
mod output;
mod utils;

use camvault::config::VaultConfig;
use commands::*;
use error::Result;
use output::{OutputFormat, OutputManager};

#[derive(Parser)]
#[command(name = "vaultctl")]
#[command(about = "vaultctl - Offline tools for camvault keys, day containers and the video index")]
#[command(version)]
#[command(long_about = "
vaultctl works directly on camvault's files and never talks to a running
service, so it can be used to recover footage from a copied disk.

Examples:
  vaultctl keygen                                       # Create the key if missing
  vaultctl inspect encrypted/2025-06-01.container       # List the chunks of a day
  vaultctl decrypt encrypted/2025-06-01.container out/  # Recover every segment
  vaultctl search --plate KA01AB1234 --format json      # Query the video index
")]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormatArg,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Key file (overrides storage.key_path)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum OutputFormatArg {
    Table,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the key file if it does not exist and print its fingerprint
    Keygen(KeygenArgs),

    /// List the chunks of a day container and report a torn tail
    Inspect(InspectArgs),

    /// Decrypt every chunk of a day container into a directory
    Decrypt(DecryptArgs),

    /// Decrypt a single legacy encrypted file
    DecryptBlob(DecryptBlobArgs),

    /// Search the uploaded video index
    Search(SearchArgs),
}

fn main() {
    let cli = Cli::parse();

    init_logging(&cli);

    if let Err(e) = run_command(cli) {
        eprintln!("{}", error::format_error(&e));
        process::exit(e.exit_code());
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().or_else(|| VaultConfig::default_config_path().ok());
    let config = VaultConfig::load_with_fallback(config_path)?;
    let ctx = Context::new(config, cli.key.clone());
    debug!("Using key file {}", ctx.key_path.display());

    let colored = !cli.no_color && !cli.quiet && console::Term::stdout().features().colors_supported();
    let output = OutputManager::new(OutputFormat::from(cli.format), colored, cli.quiet);

    match cli.command {
        Commands::Keygen(args) => commands::keygen::run(args, &ctx, &output),
        Commands::Inspect(args) => commands::inspect::run(args, &ctx, &output),
        Commands::Decrypt(args) => commands::decrypt::run(args, &ctx, &output),
        Commands::DecryptBlob(args) => commands::decrypt::run_blob(args, &ctx, &output),
        Commands::Search(args) => commands::search::run(args, &ctx, &output),
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.verbose {
        tracing::Level::INFO
    } else if cli.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };

    // Logs go to stderr so JSON output on stdout stays parseable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("vaultctl={0},camvault={0}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
