//! Core constants and limits
//!
//! Sizing limits and defaults used throughout the runtime.

use std::time::Duration;

/// Maximum number of sinks a single filter may fan out to
pub const MAX_SINKS: usize = 8;

/// Minimum ring size exponent (a ring holds at least 2 slots)
pub const MIN_RING_EXPO: u32 = 1;

/// Maximum ring size exponent (2^20 slots)
pub const MAX_RING_EXPO: u32 = 20;

/// Maximum batch capacity exponent (2^24 samples per batch)
pub const MAX_BATCH_EXPO: u32 = 24;

/// Default ring size exponent (16 slots)
pub const DEFAULT_RING_EXPO: u32 = 4;

/// Default batch capacity exponent (64 samples)
pub const DEFAULT_BATCH_EXPO: u32 = 6;

/// Default blocking budget for ring operations
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(100);

/// Blocking budget used when flushing sentinels during shutdown
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_millis(10);

static_assertions::const_assert!(MAX_SINKS >= 2);
static_assertions::const_assert!(MIN_RING_EXPO >= 1);
static_assertions::const_assert!(MAX_RING_EXPO <= 63);
static_assertions::const_assert!(DEFAULT_RING_EXPO >= MIN_RING_EXPO);
static_assertions::const_assert!(DEFAULT_RING_EXPO <= MAX_RING_EXPO);
