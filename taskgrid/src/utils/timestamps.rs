//! Timestamp helpers shared by the dispatcher and processor.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// UTC timestamp stored on task and variable records.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an RFC 3339 string with microseconds.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns true if more than `threshold` has elapsed between `since` and `now`.
///
/// A `since` in the future never counts as elapsed.
#[must_use]
pub fn elapsed_longer_than(since: Timestamp, now: Timestamp, threshold: Duration) -> bool {
    match (now - since).to_std() {
        Ok(elapsed) => elapsed > threshold,
        Err(_) => false,
    }
}
