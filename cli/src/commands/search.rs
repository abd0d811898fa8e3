use crate::commands::Context;
use crate::error::{CliError, Result};
use crate::output::OutputManager;
use camvault::service::INDEX_FILE;
use camvault::sink::{FileIndex, MetadataIndex, VideoQuery, MAX_QUERY_RESULTS};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use clap::Args;
use tracing::debug;

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// License plate to match (case-insensitive)
    #[arg(short, long)]
    pub plate: Option<String>,

    /// Only videos from this camera
    #[arg(short, long)]
    pub camera: Option<String>,

    /// Local upload day (YYYY-MM-DD), using the server's UTC offset
    #[arg(short, long)]
    pub date: Option<String>,

    /// Maximum number of results to return
    #[arg(short, long, default_value_t = MAX_QUERY_RESULTS)]
    pub limit: usize,
}

pub fn run(args: SearchArgs, ctx: &Context, output: &OutputManager) -> Result<()> {
    if args.limit == 0 {
        return Err(CliError::InvalidArgument("limit must be at least 1".to_string()));
    }

    let index_path = ctx.config.sink.base_path.join(INDEX_FILE);
    debug!("Searching index at {}", index_path.display());
    let index = FileIndex::open(&index_path, ctx.config.sink.retention())?;

    let mut query = VideoQuery {
        plate: args.plate,
        camera_id: args.camera,
        limit: Some(args.limit),
        ..VideoQuery::default()
    };
    if let Some(date) = &args.date {
        let (from, until) = local_day_window(date, ctx.config.server.utc_offset_minutes)?;
        query.from = Some(from);
        query.until = Some(until);
    }

    let videos = index.find(&query)?;
    output.print_videos(&videos)
}

/// UTC bounds of one local calendar day
fn local_day_window(date: &str, utc_offset_minutes: i32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| CliError::InvalidArgument(format!("invalid date '{}', expected YYYY-MM-DD", date)))?;
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
        CliError::InvalidArgument(format!("UTC offset of {} minutes is out of range", utc_offset_minutes))
    })?;
    let from = day
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .ok_or_else(|| CliError::InvalidArgument(format!("invalid local date '{}'", date)))?
        .with_timezone(&Utc);
    Ok((from, from + Duration::days(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_day_window() {
        let (from, until) = local_day_window("2025-06-02", 330).unwrap();
        assert_eq!(from.to_rfc3339(), "2025-06-01T18:30:00+00:00");
        assert_eq!(until - from, Duration::days(1));

        let (from, _) = local_day_window("2025-06-02", 0).unwrap();
        assert_eq!(from.to_rfc3339(), "2025-06-02T00:00:00+00:00");

        assert!(local_day_window("06/02/2025", 0).is_err());
    }
}
