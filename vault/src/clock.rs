//! Day keys for containers and the processed log

use chrono::{Local, NaiveDate};

/// Format of a day key, e.g. `2025-06-01`
pub const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

/// Source of "today" for the encryption and upload stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayClock {
    /// The local calendar date
    Local,
    /// A pinned date, for backfills and tests
    Fixed(NaiveDate),
}

impl DayClock {
    pub fn today(&self) -> NaiveDate {
        match self {
            DayClock::Local => Local::now().date_naive(),
            DayClock::Fixed(date) => *date,
        }
    }

    pub fn today_key(&self) -> String {
        day_key(self.today())
    }
}

impl Default for DayClock {
    fn default() -> Self {
        DayClock::Local
    }
}

pub fn day_key(date: NaiveDate) -> String {
    date.format(DAY_KEY_FORMAT).to_string()
}

/// Parse and normalize a day key
pub fn parse_day_key(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, DAY_KEY_FORMAT).ok()
}
