use crate::error::Result;
use crate::utils::format_bytes;
use camvault::format::{ContainerScan, StopReason};
use camvault::sink::VideoMetadata;
use console::{style, Style};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

pub struct OutputManager {
    format: OutputFormat,
    colored: bool,
    quiet: bool,
}

impl OutputManager {
    pub fn new(format: OutputFormat, colored: bool, quiet: bool) -> Self {
        Self { format, colored, quiet }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn print_key_value(&self, key: &str, value: &str) -> Result<()> {
        if self.colored {
            println!("{}: {}", style(key).cyan().bold(), value);
        } else {
            println!("{}: {}", key, value);
        }
        Ok(())
    }

    pub fn print_container(&self, scan: &ContainerScan) -> Result<()> {
        if self.format == OutputFormat::Json {
            let chunks: Vec<_> = scan
                .frames
                .iter()
                .map(|frame| {
                    json!({
                        "offset": frame.offset,
                        "filename": frame.header.original_filename,
                        "timestamp": frame.header.timestamp,
                        "file_size": frame.header.plaintext_size,
                        "duration_est_min": frame.header.duration_estimate,
                    })
                })
                .collect();
            let stopped_by = scan.stopped_by.as_ref().map(|reason| match reason {
                StopReason::Truncated { offset } => json!({ "truncated_at": offset }),
                StopReason::Corrupt { offset, reason } => json!({ "corrupt_at": offset, "reason": reason }),
            });
            return self.print_json(&json!({
                "day_header": scan.day_header,
                "chunks": chunks,
                "valid_len": scan.valid_len,
                "stopped_by": stopped_by,
            }));
        }

        self.print_key_value("Date", &scan.day_header.date)?;
        self.print_key_value("Camera", &scan.day_header.camera_id)?;
        self.print_key_value("Cipher suite", &scan.day_header.cipher_suite)?;
        self.print_key_value("Created", &scan.day_header.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())?;
        self.print_key_value("Chunks", &scan.frames.len().to_string())?;
        println!();

        let header_style = if self.colored { Style::new().bold() } else { Style::new() };
        println!(
            "{}",
            header_style.apply_to(format!("{:>12}  {:<28}  {:<20}  {:>10}  {:>5}", "OFFSET", "FILENAME", "TIMESTAMP", "SIZE", "MIN"))
        );
        for frame in &scan.frames {
            println!(
                "{:>12}  {:<28}  {:<20}  {:>10}  {:>5}",
                frame.offset,
                frame.header.original_filename,
                frame.header.timestamp.format("%Y-%m-%d %H:%M:%S"),
                format_bytes(frame.header.plaintext_size),
                frame.header.duration_estimate
            );
        }

        match &scan.stopped_by {
            None => self.print_success("Container is intact"),
            Some(StopReason::Truncated { offset }) => {
                self.print_warning(&format!("Torn trailing chunk at offset {}; the writer trims it on its next append", offset))
            }
            Some(StopReason::Corrupt { offset, reason }) => {
                self.print_error(&format!("Unreadable chunk header at offset {}: {}", offset, reason))
            }
        }
    }

    pub fn print_videos(&self, videos: &[VideoMetadata]) -> Result<()> {
        if self.format == OutputFormat::Json {
            return self.print_json(&videos);
        }
        if videos.is_empty() {
            return self.print_info("No videos found");
        }

        let header_style = if self.colored { Style::new().bold() } else { Style::new() };
        println!(
            "{}",
            header_style.apply_to(format!("{:<32}  {:<10}  {:<24}  {:<19}  {:>10}  PLATES", "ID", "CAMERA", "FILENAME", "UPLOADED", "SIZE"))
        );
        for video in videos {
            println!(
                "{:<32}  {:<10}  {:<24}  {:<19}  {:>10}  {}",
                video.storage_handle.as_str(),
                video.camera_id,
                video.filename,
                video.upload_date.format("%Y-%m-%d %H:%M:%S"),
                format_bytes(video.file_size),
                video.plate_numbers.join(",")
            );
        }
        Ok(())
    }

    pub fn print_success(&self, message: &str) -> Result<()> {
        if self.quiet || self.format == OutputFormat::Json {
            return Ok(());
        }
        if self.colored {
            println!("{} {}", style("✓").green().bold(), message);
        } else {
            println!("✓ {}", message);
        }
        Ok(())
    }

    pub fn print_warning(&self, message: &str) -> Result<()> {
        if self.colored {
            eprintln!("{} {}", style("⚠").yellow().bold(), message);
        } else {
            eprintln!("⚠ {}", message);
        }
        Ok(())
    }

    pub fn print_error(&self, message: &str) -> Result<()> {
        if self.colored {
            eprintln!("{} {}", style("✗").red().bold(), message);
        } else {
            eprintln!("✗ {}", message);
        }
        Ok(())
    }

    pub fn print_info(&self, message: &str) -> Result<()> {
        if self.quiet || self.format == OutputFormat::Json {
            return Ok(());
        }
        if self.colored {
            println!("{} {}", style("ℹ").blue().bold(), message);
        } else {
            println!("ℹ {}", message);
        }
        Ok(())
    }

    pub fn create_progress_bar(&self, total: u64, message: &str) -> ProgressBar {
        if self.quiet || !self.colored {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>5}/{len:5} {msg}")
        {
            pb.set_style(bar_style.progress_chars("#>-"));
        }
        pb.set_message(message.to_string());
        pb
    }
}
