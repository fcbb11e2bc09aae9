/// Utility functions for timestamps and formatting
use std::sync::atomic::{AtomicI64, Ordering};
use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Milliseconds since the Unix epoch
pub fn unix_millis(dt: &OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Capture-time source for samples, never running backwards
///
/// Two samples in the same millisecond share a timestamp; a wall clock step
/// backwards is held at the last value handed out.
#[derive(Debug, Default)]
pub struct SampleClock {
    last: AtomicI64,
}

impl SampleClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_millis(&self) -> i64 {
        self.stamp(unix_millis(&OffsetDateTime::now_utc()))
    }

    fn stamp(&self, wall: i64) -> i64 {
        let previous = self.last.fetch_max(wall, Ordering::SeqCst);
        previous.max(wall)
    }
}
