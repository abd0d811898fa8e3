use crate::commands::Context;
use crate::error::{CliError, Result};
use crate::output::OutputManager;
use camvault::crypto::ChunkDecryptor;
use camvault::error::CryptoError;
use camvault::format::ContainerReader;
use clap::Args;
use std::path::PathBuf;
use tracing::debug;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Day container to inspect
    pub container: PathBuf,

    /// Also decrypt every chunk to check its authentication tag (needs the key)
    #[arg(long)]
    pub verify: bool,
}

pub fn run(args: InspectArgs, ctx: &Context, output: &OutputManager) -> Result<()> {
    if !args.container.is_file() {
        return Err(CliError::FileNotFound { path: args.container.display().to_string() });
    }

    let scan = ContainerReader::open(&args.container)?.scan();
    debug!("Scanned {} chunks in {}", scan.frames.len(), args.container.display());
    output.print_container(&scan)?;

    if !args.verify {
        return Ok(());
    }

    let decryptor = ChunkDecryptor::new(ctx.load_key()?);
    let mut reader = ContainerReader::open(&args.container)?;
    let progress = output.create_progress_bar(scan.frames.len() as u64, "verifying");
    let mut failures = 0usize;
    for frame in &scan.frames {
        let record = reader.read_record(frame)?;
        match decryptor.decrypt(record) {
            Ok(_) => {}
            Err(CryptoError::IntegrityFailure) => {
                failures += 1;
                output.print_error(&format!(
                    "{} at offset {} failed authentication",
                    frame.header.original_filename, frame.offset
                ))?;
            }
            Err(e) => return Err(e.into()),
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    if failures > 0 {
        return Err(CryptoError::IntegrityFailure.into());
    }
    output.print_success(&format!("All {} chunks authenticated", scan.frames.len()))
}
