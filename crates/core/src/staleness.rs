#![forbid(unsafe_code)]

use std::time::Duration;

/// Milliseconds since `lease_time_ms`. Negative ages (clock skew between
/// members) read as zero so a lease from the future is never stale.
pub fn lease_age_ms(lease_time_ms: i64, now_ms: i64) -> i64 {
    now_ms.saturating_sub(lease_time_ms).max(0)
}

pub fn threshold_ms(threshold: Duration) -> i64 {
    threshold.as_millis().min(i64::MAX as u128) as i64
}

/// A lease is stale once it has gone unrenewed for strictly longer than
/// `threshold`.
pub fn is_stale(lease_time_ms: i64, now_ms: i64, threshold: Duration) -> bool {
    lease_age_ms(lease_time_ms, now_ms) > threshold_ms(threshold)
}
