//! Per-filter counters
//!
//! Counters are owned by the worker thread and written with relaxed atomics;
//! readers take a point-in-time snapshot and accept stale values.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by a filter's worker
#[derive(Debug)]
pub struct FilterStats {
    batches_in: AtomicU64,
    batches_out: AtomicU64,
    samples_in: AtomicU64,
    samples_out: AtomicU64,
    timeouts: AtomicU64,
    last_t_ns: AtomicU64,
    /// One drop counter per sink port
    dropped: Box<[AtomicU64]>,
}

impl FilterStats {
    /// Counters for a filter with `num_sinks` sink ports
    pub fn new(num_sinks: usize) -> Self {
        Self {
            batches_in: AtomicU64::new(0),
            batches_out: AtomicU64::new(0),
            samples_in: AtomicU64::new(0),
            samples_out: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            last_t_ns: AtomicU64::new(0),
            dropped: (0..num_sinks).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Record one consumed batch of `samples` samples
    pub fn record_in(&self, samples: usize) {
        self.batches_in.fetch_add(1, Ordering::Relaxed);
        self.samples_in.fetch_add(samples as u64, Ordering::Relaxed);
    }

    /// Record one produced batch of `samples` samples stamped `t_ns`
    pub fn record_out(&self, samples: usize, t_ns: u64) {
        self.batches_out.fetch_add(1, Ordering::Relaxed);
        self.samples_out.fetch_add(samples as u64, Ordering::Relaxed);
        self.last_t_ns.store(t_ns, Ordering::Relaxed);
    }

    /// Record a blocking budget expiry
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch dropped at sink `port`
    pub fn record_drop(&self, port: usize) {
        if let Some(counter) = self.dropped.get(port) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Batches dropped at sink `port` so far
    pub fn dropped_at(&self, port: usize) -> u64 {
        self.dropped
            .get(port)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_in: self.batches_in.load(Ordering::Relaxed),
            batches_out: self.batches_out.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_t_ns: self.last_t_ns.load(Ordering::Relaxed),
            dropped_batches: self.dropped.iter().map(|c| c.load(Ordering::Relaxed)).collect(),
        }
    }
}

/// Snapshot of a filter's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    /// Batches consumed from input rings
    pub batches_in: u64,
    /// Batches published to sinks
    pub batches_out: u64,
    /// Samples consumed
    pub samples_in: u64,
    /// Samples published
    pub samples_out: u64,
    /// Blocking budget expiries observed
    pub timeouts: u64,
    /// Timestamp of the most recently published batch
    pub last_t_ns: u64,
    /// Batches dropped per sink port
    pub dropped_batches: Vec<u64>,
}
