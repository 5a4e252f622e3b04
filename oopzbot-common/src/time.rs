//! Timestamp utilities

use chrono::Utc;

/// Current wall-clock time as fractional epoch seconds
///
/// This is the unit of `PlayState::start_time`.
pub fn epoch_secs() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Today's date as `YYYY-MM-DD` (UTC), the key of the daily statistics row
pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
