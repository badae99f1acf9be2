//! Epoch-millisecond timestamp helpers.
//!
//! Every timestamp column is an `INTEGER` holding UTC milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Current time in epoch milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert epoch milliseconds back into a `DateTime<Utc>`.
///
/// Out-of-range values clamp to chrono's representable bounds.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .earliest()
        .unwrap_or(if ms.is_negative() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// `ms` shifted back by `window`, saturating at `i64::MIN`.
#[inline]
pub fn ms_before(ms: i64, window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    ms.saturating_sub(window_ms)
}
