//! Timestamp utilities
//!
//! All engine code reads the clock through [`TimeSource`] so elapsed-time
//! behavior (connection levels, milestones, pass cool-down, scoring day) can be
//! driven deterministically in tests.

use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::{Arc, RwLock};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Storage representation of a timestamp (microseconds since the Unix epoch)
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

/// Inverse of [`to_micros`]
pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| Error::InvalidInput(format!("Timestamp out of range: {}", micros)))
}

/// UTC calendar day containing `ts`
pub fn day_of(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

/// Time source for consistent timestamp handling.
pub trait TimeSource: Send + Sync {
    /// Returns the current UTC timestamp.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the UTC calendar day of [`TimeSource::now`].
    fn today(&self) -> NaiveDate {
        day_of(self.now())
    }
}

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        now()
    }
}

/// Manually driven time source.
///
/// Clones share the same instant, so a test can keep one handle and advance
/// the clock seen by an engine that holds another.
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualTimeSource {
    /// Create a time source frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock to `ts`
    pub fn set(&self, ts: DateTime<Utc>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = ts;
    }

    /// Move the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current += by;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
    }

    #[test]
    fn test_millis_to_duration_one_second() {
        let duration = millis_to_duration(1000);
        assert_eq!(duration, std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_micros_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 15, 9, 26).unwrap() + Duration::microseconds(535);
        assert_eq!(from_micros(to_micros(ts)).unwrap(), ts);
    }

    #[test]
    fn test_from_micros_out_of_range() {
        assert!(from_micros(i64::MAX).is_err());
    }

    #[test]
    fn test_manual_time_source_advance_is_shared() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualTimeSource::new(start);
        let handle = clock.clone();

        handle.advance(Duration::days(40));

        assert_eq!(clock.now(), start + Duration::days(40));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
    }

    #[test]
    fn test_manual_time_source_set() {
        let clock = ManualTimeSource::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let later = Utc.with_ymd_and_hms(2027, 6, 1, 12, 0, 0).unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }

    #[test]
    fn test_system_time_source_today_matches_now() {
        let source = SystemTimeSource;
        assert_eq!(source.today(), day_of(source.now()));
    }
}
