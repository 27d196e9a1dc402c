//! Wall-clock timestamps
//!
//! Records that cross process boundaries (batch records, line records) carry
//! unix timestamps rather than `Instant`s.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current unix time in whole seconds.
pub fn unix_secs() -> u64 {
    unix_millis() / 1000
}
