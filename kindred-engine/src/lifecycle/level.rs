//! Connection level derivation
//!
//! Level is a pure function of (connected_at, now, interaction_count). The
//! stored `level` column is only a cache of this function's last result.

use crate::config::LifecycleConfig;
use chrono::{DateTime, Utc};
use kindred_common::models::ConnectionLevel;

/// Whole days elapsed since `connected_at` (never negative)
pub fn age_days(connected_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - connected_at).num_days().max(0)
}

/// Derive the level of a connection
///
/// Rules, first match wins:
/// - `close`: older than `close_min_age_days` with at least `close_min_interactions`
/// - `established`: at least `established_min_age_days` old with at least
///   `established_min_interactions`
/// - `new`: younger than `new_max_age_days` with fewer than `new_max_interactions`
/// - `growing`: everything else
pub fn recompute_level(
    connected_at: DateTime<Utc>,
    now: DateTime<Utc>,
    interaction_count: u64,
    thresholds: &LifecycleConfig,
) -> ConnectionLevel {
    let age = age_days(connected_at, now);

    if age > thresholds.close_min_age_days && interaction_count >= thresholds.close_min_interactions {
        ConnectionLevel::Close
    } else if age >= thresholds.established_min_age_days
        && interaction_count >= thresholds.established_min_interactions
    {
        ConnectionLevel::Established
    } else if age < thresholds.new_max_age_days && interaction_count < thresholds.new_max_interactions {
        ConnectionLevel::New
    } else {
        ConnectionLevel::Growing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn level(days: i64, count: u64) -> ConnectionLevel {
        recompute_level(start(), start() + Duration::days(days), count, &LifecycleConfig::default())
    }

    #[test]
    fn test_fresh_connection_is_new() {
        assert_eq!(level(0, 1), ConnectionLevel::New);
    }

    #[test]
    fn test_forty_days_twelve_interactions_is_established() {
        assert_eq!(level(40, 12), ConnectionLevel::Established);
    }

    #[test]
    fn test_growing_cases() {
        assert_eq!(level(10, 2), ConnectionLevel::Growing);
        assert_eq!(level(2, 8), ConnectionLevel::Growing);
        assert_eq!(level(40, 3), ConnectionLevel::Growing);
    }

    #[test]
    fn test_close_needs_age_and_interactions() {
        assert_eq!(level(91, 40), ConnectionLevel::Close);
        assert_eq!(level(90, 40), ConnectionLevel::Established);
        assert_eq!(level(200, 20), ConnectionLevel::Established);
    }

    #[test]
    fn test_same_inputs_same_level() {
        for (days, count) in [(0, 0), (6, 4), (7, 4), (28, 10), (95, 100)] {
            assert_eq!(level(days, count), level(days, count));
        }
    }

    #[test]
    fn test_clock_behind_connection_counts_as_age_zero() {
        let level = recompute_level(start(), start() - Duration::hours(3), 0, &LifecycleConfig::default());
        assert_eq!(level, ConnectionLevel::New);
    }
}
