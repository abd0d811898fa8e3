use crate::commands::Context;
use crate::error::{CliError, Result};
use crate::output::{OutputFormat, OutputManager};
use crate::utils::{format_bytes, unique_output_path};
use camvault::crypto::ChunkDecryptor;
use camvault::error::CryptoError;
use camvault::format::{ContainerReader, LegacyBlob, StopReason};
use camvault::fsutil::write_atomic;
use clap::Args;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct DecryptArgs {
    /// Day container to decrypt
    pub container: PathBuf,

    /// Directory receiving one file per chunk, named after the source segment
    pub out_dir: PathBuf,
}

#[derive(Args, Debug)]
pub struct DecryptBlobArgs {
    /// Legacy encrypted file (nonce, tag, ciphertext)
    pub input: PathBuf,

    /// Where to write the plaintext
    pub output: PathBuf,
}

/// Decrypt every complete chunk of a container into `out_dir`.
///
/// Chunks are written in container order; the first chunk that fails
/// authentication stops the run with the earlier files left in place.
pub fn run(args: DecryptArgs, ctx: &Context, output: &OutputManager) -> Result<()> {
    require_file(&args.container)?;
    let decryptor = ChunkDecryptor::new(ctx.load_key()?);

    let scan = ContainerReader::open(&args.container)?.scan();
    let mut reader = ContainerReader::open(&args.container)?;
    fs::create_dir_all(&args.out_dir)?;

    let progress = output.create_progress_bar(scan.frames.len() as u64, "decrypting");
    let mut written = Vec::with_capacity(scan.frames.len());
    let mut total_bytes = 0u64;

    for frame in &scan.frames {
        let record = reader.read_record(frame)?;
        let plaintext = match decryptor.decrypt(record) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::IntegrityFailure) => {
                progress.abandon();
                return Err(CliError::CorruptChunk {
                    filename: frame.header.original_filename.clone(),
                    offset: frame.offset,
                    written: written.len(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let target = unique_output_path(&args.out_dir, &frame.header.original_filename);
        write_atomic(&target, |file| file.write_all(&plaintext))?;
        debug!("Wrote {} ({} bytes)", target.display(), plaintext.len());
        total_bytes += plaintext.len() as u64;
        written.push(target);
        progress.inc(1);
    }
    progress.finish_and_clear();

    match &scan.stopped_by {
        Some(StopReason::Truncated { offset }) => {
            output.print_warning(&format!("Skipped torn trailing chunk at offset {}", offset))?
        }
        Some(StopReason::Corrupt { offset, reason }) => output.print_warning(&format!(
            "Stopped at unreadable chunk header at offset {}: {}",
            offset, reason
        ))?,
        None => {}
    }
    info!("Decrypted {} chunks from {}", written.len(), args.container.display());

    if output.format() == OutputFormat::Json {
        let files: Vec<String> = written.iter().map(|p| p.display().to_string()).collect();
        return output.print_json(&json!({
            "container": args.container.display().to_string(),
            "files": files,
            "bytes": total_bytes,
            "complete": scan.is_clean(),
        }));
    }

    output.print_success(&format!(
        "Decrypted {} chunks ({}) into {}",
        written.len(),
        format_bytes(total_bytes),
        args.out_dir.display()
    ))
}

/// Decrypt a single pre-container encrypted file.
pub fn run_blob(args: DecryptBlobArgs, ctx: &Context, output: &OutputManager) -> Result<()> {
    require_file(&args.input)?;
    let decryptor = ChunkDecryptor::new(ctx.load_key()?);

    let blob = LegacyBlob::parse(&fs::read(&args.input)?)?;
    let plaintext = decryptor.decrypt_legacy(blob)?;
    // A bare filename has an empty parent, which the atomic writer cannot sync
    let target = if args.output.is_absolute() {
        args.output.clone()
    } else {
        std::env::current_dir()?.join(&args.output)
    };
    write_atomic(&target, |file| file.write_all(&plaintext))?;

    if output.format() == OutputFormat::Json {
        return output.print_json(&json!({
            "output": args.output.display().to_string(),
            "bytes": plaintext.len(),
        }));
    }
    output.print_success(&format!(
        "Decrypted {} ({}) to {}",
        args.input.display(),
        format_bytes(plaintext.len() as u64),
        args.output.display()
    ))
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CliError::FileNotFound { path: path.display().to_string() })
    }
}
