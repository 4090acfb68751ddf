use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const WALL_CLOCK: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const ISO_WALL_CLOCK: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const DIR_STAMP: &[FormatItem<'static>] =
    format_description!("[year][month][day]-[hour][minute][second]");

/// Converts between `SystemTime` and the wall-clock strings the schedulers print,
/// which are always in the site's local offset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SiteClock {
    offset: UtcOffset,
}

impl SiteClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Falls back to UTC when the hour count is out of range.
    pub fn from_offset_hours(hours: i8) -> Self {
        Self::new(UtcOffset::from_hms(hours, 0, 0).unwrap_or(UtcOffset::UTC))
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Parses `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DDTHH:MM:SS`.
    /// Placeholders such as `Unknown`, `None` or `undefined` yield `None`.
    pub fn parse_wall_clock(&self, raw: &str) -> Option<SystemTime> {
        let raw = raw.trim();
        let parsed = PrimitiveDateTime::parse(raw, WALL_CLOCK)
            .or_else(|_| PrimitiveDateTime::parse(raw, ISO_WALL_CLOCK))
            .ok()?;
        Some(parsed.assume_offset(self.offset).into())
    }

    pub fn from_epoch(&self, raw: &str) -> Option<SystemTime> {
        let seconds: u64 = raw.trim().parse().ok()?;
        if seconds == 0 {
            return None;
        }
        Some(UNIX_EPOCH + Duration::from_secs(seconds))
    }

    pub fn format(&self, instant: SystemTime) -> String {
        self.local(instant)
            .format(WALL_CLOCK)
            .unwrap_or_else(|_| String::from("-"))
    }

    /// `yyyymmdd-HHMMSS`, used to name job directories.
    pub fn dir_stamp(&self, instant: SystemTime) -> String {
        self.local(instant)
            .format(DIR_STAMP)
            .unwrap_or_else(|_| String::from("00000000-000000"))
    }

    fn local(&self, instant: SystemTime) -> OffsetDateTime {
        OffsetDateTime::from(instant).to_offset(self.offset)
    }
}

impl Default for SiteClock {
    fn default() -> Self {
        Self::from_offset_hours(8)
    }
}
