//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice::{BatchRing, Filter, OverflowPolicy, RingConfig, SampleType};

pub const WAIT: Duration = Duration::from_millis(500);

/// Started ring with the given shape
pub fn ring(
    name: &str,
    dtype: SampleType,
    batch_expo: u32,
    ring_expo: u32,
    policy: OverflowPolicy,
) -> Arc<BatchRing> {
    let ring = BatchRing::new(
        RingConfig::new(name, dtype)
            .with_batch_expo(batch_expo)
            .unwrap()
            .with_ring_expo(ring_expo)
            .unwrap()
            .with_overflow_policy(policy),
    )
    .unwrap();
    ring.start();
    ring
}

/// Publish one f32 batch with explicit metadata
pub fn feed_f32(ring: &BatchRing, values: &[f32], t_ns: u64, period_ns: u64, batch_id: u64) {
    let mut slot = ring.get_head(WAIT).unwrap();
    slot.samples_mut::<f32>().unwrap()[..values.len()].copy_from_slice(values);
    slot.set_head(values.len()).unwrap();
    slot.t_ns = t_ns;
    slot.period_ns = period_ns;
    slot.batch_id = batch_id;
    slot.submit().unwrap();
}

/// Publish the end-of-stream sentinel
pub fn feed_complete(ring: &BatchRing, batch_id: u64) {
    let mut slot = ring.get_head(WAIT).unwrap();
    slot.mark_complete();
    slot.batch_id = batch_id;
    slot.submit().unwrap();
}

/// Consumed batch with its metadata, for assertions
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub values: Vec<f32>,
    pub t_ns: u64,
    pub period_ns: u64,
    pub batch_id: u64,
    pub complete: bool,
}

/// Pull one batch off a terminal ring
pub fn drain_one(ring: &BatchRing) -> Observed {
    let batch = ring.get_tail(WAIT).unwrap();
    let observed = Observed {
        values: batch.samples::<f32>().unwrap().to_vec(),
        t_ns: batch.t_ns,
        period_ns: batch.period_ns,
        batch_id: batch.batch_id,
        complete: batch.is_complete(),
    };
    batch.release();
    observed
}

/// Block until the filter's worker has wound itself down
pub fn await_worker_exit(filter: &dyn Filter, budget: Duration) {
    let deadline = Instant::now() + budget;
    while filter.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(
        !filter.is_running(),
        "worker for `{}` still running after {budget:?}",
        filter.name()
    );
}
