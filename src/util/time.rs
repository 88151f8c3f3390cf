//! Helpers for dealing with timestamps

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as nanoseconds since the Unix epoch
pub fn now_nsecs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("Fix your clock :o")
		.as_nanos() as i64
}
