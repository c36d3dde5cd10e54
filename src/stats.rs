//! Numeric helpers for offline-threshold estimation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::IntervalSample;

/// Lower bound of any derived offline threshold, in seconds.
pub const MIN_OFFLINE_THRESHOLD_SEC: i64 = 180;

/// Upper bound of any derived offline threshold, in seconds.
pub const MAX_OFFLINE_THRESHOLD_SEC: i64 = 600;

/// Gaps at or above this many seconds are restarts or outages, not cadence.
pub const MAX_REPORTING_GAP_SEC: i64 = 3600;

/// Number of reporting cycles tolerated before a room counts as offline.
const MISSED_CYCLES: i64 = 3;

/// Slack added on top of the tolerated cycles.
const MARGIN_SEC: i64 = 30;

/// Nearest-rank percentile of an ascending slice.
///
/// Picks the element at `floor(len * q)` without interpolation, clamped to
/// the last element so that `q = 1.0` stays in bounds. Returns `None` for an
/// empty slice.
pub fn percentile_nearest_rank(sorted: &[i64], q: f64) -> Option<i64> {
    if sorted.is_empty() {
        return None;
    }
    let index = (sorted.len() as f64 * q).floor() as usize;
    sorted.get(index.min(sorted.len() - 1)).copied()
}

/// Consecutive reporting gaps, in whole seconds, per device channel.
///
/// Samples are grouped by `key12` and ordered by time within each group.
/// Non-positive gaps and gaps of an hour or more are dropped.
pub fn reporting_intervals(samples: &[IntervalSample]) -> Vec<i64> {
    let mut groups: BTreeMap<&str, Vec<DateTime<Utc>>> = BTreeMap::new();
    for sample in samples {
        groups
            .entry(sample.key12.as_str())
            .or_default()
            .push(sample.created_at);
    }

    let mut intervals = Vec::new();
    for timestamps in groups.values_mut() {
        timestamps.sort();
        for pair in timestamps.windows(2) {
            let gap = (pair[1] - pair[0]).num_seconds();
            if gap > 0 && gap < MAX_REPORTING_GAP_SEC {
                intervals.push(gap);
            }
        }
    }
    intervals
}

/// Offline threshold for a farm whose P95 reporting interval is `p95_sec`.
///
/// Tolerates three missed cycles plus a margin, bounded to
/// `[MIN_OFFLINE_THRESHOLD_SEC, MAX_OFFLINE_THRESHOLD_SEC]`.
pub fn derive_offline_threshold(p95_sec: i64) -> i64 {
    let scaled = p95_sec
        .saturating_mul(MISSED_CYCLES)
        .saturating_add(MARGIN_SEC);
    scaled
        .max(MIN_OFFLINE_THRESHOLD_SEC)
        .clamp(MIN_OFFLINE_THRESHOLD_SEC, MAX_OFFLINE_THRESHOLD_SEC)
}

/// Whole seconds elapsed from `then` to `now`, rounded down.
pub fn freshness_sec(now: DateTime<Utc>, then: DateTime<Utc>) -> i64 {
    (now - then).num_milliseconds().div_euclid(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(key12: &str, at: DateTime<Utc>) -> IntervalSample {
        IntervalSample {
            key12: key12.to_string(),
            created_at: at,
        }
    }

    #[test]
    fn test_percentile_picks_largest_of_ten() {
        let values: Vec<i64> = (1..=10).map(|v| v * 10).collect();
        assert_eq!(percentile_nearest_rank(&values, 0.95), Some(100));
        assert_eq!(percentile_nearest_rank(&values, 0.5), Some(60));
    }

    #[test]
    fn test_percentile_edges() {
        assert_eq!(percentile_nearest_rank(&[], 0.95), None);
        assert_eq!(percentile_nearest_rank(&[42], 0.95), Some(42));
        assert_eq!(percentile_nearest_rank(&[1, 2, 3], 1.0), Some(3));
    }

    #[test]
    fn test_percentile_no_interpolation() {
        let values: Vec<i64> = (1..=100).collect();
        // floor(100 * 0.95) = 95 -> 96th value
        assert_eq!(percentile_nearest_rank(&values, 0.95), Some(96));
    }

    #[test]
    fn test_derive_threshold_clamps() {
        assert_eq!(derive_offline_threshold(0), 180);
        assert_eq!(derive_offline_threshold(50), 180);
        assert_eq!(derive_offline_threshold(60), 210);
        assert_eq!(derive_offline_threshold(100), 330);
        assert_eq!(derive_offline_threshold(190), 600);
        assert_eq!(derive_offline_threshold(1000), 600);
        assert_eq!(derive_offline_threshold(i64::MAX), 600);
    }

    #[test]
    fn test_derive_threshold_always_in_range() {
        for p95 in (-100..5000).step_by(7) {
            let th = derive_offline_threshold(p95);
            assert!((MIN_OFFLINE_THRESHOLD_SEC..=MAX_OFFLINE_THRESHOLD_SEC).contains(&th));
        }
    }

    #[test]
    fn test_intervals_grouped_per_key() {
        let t0 = Utc::now();
        let samples = vec![
            sample("FARM01010101", t0),
            sample("FARM01010101", t0 + Duration::seconds(60)),
            sample("FARM01010101", t0 + Duration::seconds(130)),
            sample("FARM01010102", t0 + Duration::seconds(5)),
            sample("FARM01010102", t0 + Duration::seconds(65)),
        ];

        let mut intervals = reporting_intervals(&samples);
        intervals.sort();
        assert_eq!(intervals, vec![60, 60, 70]);
    }

    #[test]
    fn test_intervals_drop_duplicates_and_long_gaps() {
        let t0 = Utc::now();
        let samples = vec![
            sample("FARM01010101", t0),
            sample("FARM01010101", t0),
            sample("FARM01010101", t0 + Duration::seconds(3600)),
            sample("FARM01010101", t0 + Duration::seconds(3600 + 3599)),
        ];

        assert_eq!(reporting_intervals(&samples), vec![3599]);
    }

    #[test]
    fn test_intervals_sub_second_gap_is_dropped() {
        let t0 = Utc::now();
        let samples = vec![
            sample("FARM01010101", t0),
            sample("FARM01010101", t0 + Duration::milliseconds(900)),
        ];

        assert!(reporting_intervals(&samples).is_empty());
    }

    #[test]
    fn test_freshness_rounds_down() {
        let now = Utc::now();
        assert_eq!(freshness_sec(now, now - Duration::milliseconds(1999)), 1);
        assert_eq!(freshness_sec(now, now), 0);
        assert_eq!(freshness_sec(now, now + Duration::milliseconds(500)), -1);
    }
}
