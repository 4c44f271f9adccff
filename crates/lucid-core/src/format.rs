//! Human-readable clock rendering for status strings and history notes.

use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::domain::US_PER_SEC;

/// Renders timestamps as 12-hour clock times in a fixed display offset.
#[derive(Debug, Clone, Copy)]
pub struct ClockFormatter {
    offset: FixedOffset,
}

impl Default for ClockFormatter {
    fn default() -> Self {
        Self::utc()
    }
}

impl ClockFormatter {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    /// Offsets outside +/-24h fall back to UTC.
    pub fn with_offset_minutes(minutes: i32) -> Self {
        match FixedOffset::east_opt(minutes.saturating_mul(60)) {
            Some(offset) => Self { offset },
            None => {
                log::warn!("Invalid display offset {}min, using UTC", minutes);
                Self::utc()
            }
        }
    }

    fn to_datetime(&self, ts_us: i64) -> Option<DateTime<FixedOffset>> {
        let secs = ts_us.div_euclid(US_PER_SEC);
        let nanos = (ts_us.rem_euclid(US_PER_SEC) * 1_000) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos).map(|dt| dt.with_timezone(&self.offset))
    }

    /// `"1:30 AM"`
    pub fn time(&self, ts_us: i64) -> String {
        match self.to_datetime(ts_us) {
            Some(dt) => dt.format("%-I:%M %p").to_string(),
            None => "--:--".to_string(),
        }
    }

    /// `"1:30 AM – 1:50 AM"`
    pub fn interval(&self, start_us: i64, end_us: i64) -> String {
        format!("{} \u{2013} {}", self.time(start_us), self.time(end_us))
    }
}
