use crate::commands::Context;
use crate::error::{CliError, Result};
use crate::output::{OutputFormat, OutputManager};
use camvault::keys::KeyMaterial;
use clap::Args;
use serde_json::json;

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Fail if a key already exists instead of reporting it
    #[arg(long)]
    pub require_new: bool,
}

pub fn run(args: KeygenArgs, ctx: &Context, output: &OutputManager) -> Result<()> {
    if args.require_new && ctx.key_path.exists() {
        return Err(CliError::InvalidArgument(format!(
            "key already exists at {}",
            ctx.key_path.display()
        )));
    }

    let (key, created) = KeyMaterial::load_or_generate(&ctx.key_path)?;

    if output.format() == OutputFormat::Json {
        return output.print_json(&json!({
            "path": ctx.key_path.display().to_string(),
            "fingerprint": key.fingerprint(),
            "created": created,
        }));
    }

    if created {
        output.print_success(&format!("Generated key at {}", ctx.key_path.display()))?;
    } else {
        output.print_info(&format!("Key already exists at {}, left unchanged", ctx.key_path.display()))?;
    }
    output.print_key_value("Fingerprint", &key.fingerprint())
}
