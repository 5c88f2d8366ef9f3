// src/time.rs
//! Timestamps for cache bookkeeping.
//!
//! `last_use_time` / `last_save_time` get embedded in disk-tier filenames and must
//! stay comparable across process restarts (a new process loading yesterday's cache
//! directory still needs older files to evict before newer ones). A process-local
//! monotonic clock can't give that; wall-clock nanoseconds since the Unix epoch can,
//! at the ordinary cost of being sensitive to clock adjustments.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch, used as a comparable recency timestamp.
#[inline]
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
