//! Nanosecond time helpers for producers and tests

use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static MONOTONIC_BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Current wall-clock time in nanoseconds since the Unix epoch
pub fn wall_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Monotonic nanoseconds since the first call into this module
pub fn monotonic_nanos() -> u64 {
    MONOTONIC_BASE.elapsed().as_nanos() as u64
}
