//! Timestamp utilities.
//!
//! Timers, heartbeats and the handshake's uptime value all share one
//! millisecond clock so comparisons between them are meaningful.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
///
/// A clock set before the epoch yields zero rather than panicking; every
/// consumer treats zero as "no timestamp yet".
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
