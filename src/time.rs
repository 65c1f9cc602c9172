//! Timestamp normalization between caller and store units.
//!
//! Callers work in wall-clock milliseconds; the persistent store keeps
//! integer seconds. Conversion happens exactly once, at the storage
//! boundary, so the rest of the engine never mixes units. Sub-second
//! precision is intentionally lost on the write path.

use chrono::Utc;

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert caller milliseconds to store seconds (floor division, so
/// pre-epoch timestamps round toward negative infinity rather than zero).
pub fn millis_to_store_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

/// Convert store seconds back to caller milliseconds.
pub fn store_secs_to_millis(secs: i64) -> i64 {
    secs.saturating_mul(1000)
}

pub fn opt_millis_to_store_secs(ms: Option<i64>) -> Option<i64> {
    ms.map(millis_to_store_secs)
}

pub fn opt_store_secs_to_millis(secs: Option<i64>) -> Option<i64> {
    secs.map(store_secs_to_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_floor_to_seconds() {
        assert_eq!(millis_to_store_secs(0), 0);
        assert_eq!(millis_to_store_secs(999), 0);
        assert_eq!(millis_to_store_secs(1000), 1);
        assert_eq!(millis_to_store_secs(1754_000_123_456), 1754_000_123);
    }

    #[test]
    fn negative_millis_round_down() {
        // div_euclid, not truncation: -1ms is second -1, not second 0
        assert_eq!(millis_to_store_secs(-1), -1);
        assert_eq!(millis_to_store_secs(-1000), -1);
        assert_eq!(millis_to_store_secs(-1001), -2);
    }

    #[test]
    fn round_trip_loses_only_subsecond_precision() {
        let ms = 1754_000_123_456;
        let back = store_secs_to_millis(millis_to_store_secs(ms));
        assert_eq!(back, 1754_000_123_000);
        assert!(ms - back < 1000);
    }

    #[test]
    fn round_trip_preserves_ordering_across_seconds() {
        let early = store_secs_to_millis(millis_to_store_secs(5_000));
        let late = store_secs_to_millis(millis_to_store_secs(6_500));
        assert!(early < late);
    }

    #[test]
    fn optional_helpers_pass_none_through() {
        assert_eq!(opt_millis_to_store_secs(None), None);
        assert_eq!(opt_store_secs_to_millis(None), None);
        assert_eq!(opt_millis_to_store_secs(Some(2500)), Some(2));
        assert_eq!(opt_store_secs_to_millis(Some(2)), Some(2000));
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
