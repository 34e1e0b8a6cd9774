//! Tee - broadcasts one input to N outputs with per-output overflow policy
//!
//! Every bound sink receives a deep copy of each input batch. Output 0 is the
//! latency-priority path: it is attempted first, and because its ring's
//! policy governs whether the worker blocks, it alone propagates
//! backpressure to the input. Other outputs running a drop policy lose
//! batches independently and account for them in per-port drop counters.

use std::time::Duration;

use crate::batch::SampleType;
use crate::constants::{
    DEFAULT_BATCH_EXPO, DEFAULT_OP_TIMEOUT, DEFAULT_RING_EXPO, MAX_SINKS,
};
use crate::error::{Result, SluiceError};
use crate::filter::{Filter, FilterCore, FilterKind, SinkRequirements, SlotState};
use crate::ring::{OverflowPolicy, RingConfig};
use crate::worker_error;

/// Configuration for a [`Tee`] filter
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TeeConfig {
    /// Filter name; the input ring is named `<name>.in`
    pub name: String,
    /// Element type broadcast to every output
    pub dtype: SampleType,
    /// Input ring batch capacity is `2^batch_expo` samples
    pub batch_expo: u32,
    /// Input ring depth is `2^ring_expo` slots
    pub ring_expo: u32,
    /// Overflow policy of the owned input ring
    pub overflow_policy: OverflowPolicy,
    /// Sample bytes are deep-copied into each output; must be true
    /// (shared-ownership fan-out is reserved for a future revision)
    pub copy_data: bool,
    /// Blocking budget for the worker's ring operations
    pub timeout: Duration,
}

impl TeeConfig {
    /// Defaults: 64-sample batches, 16-slot blocking input ring, deep copy
    pub fn new(name: impl Into<String>, dtype: SampleType) -> Self {
        Self {
            name: name.into(),
            dtype,
            batch_expo: DEFAULT_BATCH_EXPO,
            ring_expo: DEFAULT_RING_EXPO,
            overflow_policy: OverflowPolicy::Block,
            copy_data: true,
            timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

/// 1→N broadcast with independent per-output overflow handling
pub struct Tee {
    core: FilterCore,
    dtype: SampleType,
    batch_capacity: usize,
}

impl Tee {
    /// Allocate the filter and its owned input ring
    pub fn new(config: TeeConfig) -> Result<Self> {
        if !config.copy_data {
            return Err(SluiceError::config(
                "tee requires copy_data: shared-ownership fan-out is not supported",
            ));
        }
        let ring_config = RingConfig {
            name: format!("{}.in", config.name),
            dtype: config.dtype,
            batch_expo: config.batch_expo,
            ring_expo: config.ring_expo,
            overflow_policy: config.overflow_policy,
        };
        ring_config.validate()?;
        let batch_capacity = ring_config.batch_capacity();
        let core = FilterCore::new(
            config.name,
            FilterKind::Tee,
            vec![ring_config],
            MAX_SINKS,
            config.timeout,
        )?;
        Ok(Self {
            core,
            dtype: config.dtype,
            batch_capacity,
        })
    }
}

impl Filter for Tee {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn sink_requirements(&self, port: usize) -> Result<SinkRequirements> {
        if port >= MAX_SINKS {
            return Err(SluiceError::InvalidSinkIdx {
                index: port,
                max: MAX_SINKS,
            });
        }
        // Every output must mirror the input exactly
        Ok(SinkRequirements::exact(self.dtype, self.batch_capacity))
    }

    fn start(&mut self) -> Result<()> {
        if self.core.sinks_bound() < 2 {
            return Err(SluiceError::NoSink {
                filter: self.core.name().to_string(),
            });
        }
        self.core.start_worker(|ctx| {
            // Sentinel id for the stop path, one past the last batch seen
            let mut next_id = 0u64;
            loop {
                let Some(input) = ctx.next_input(0)? else {
                    // Stop requested: close every output with a sentinel
                    ctx.forward_complete(next_id);
                    return Ok(());
                };
                if input.is_complete() {
                    ctx.forward_complete(input.batch_id);
                    input.release();
                    return Ok(());
                }

                ctx.stats().record_in(input.head);
                next_id = input.batch_id + 1;

                // Port 0 first: its policy is authoritative for backpressure
                let ports: Vec<usize> = ctx.bound_sinks().map(|(port, _)| port).collect();
                for port in ports {
                    match ctx.output_slot(port)? {
                        SlotState::Stopped => {
                            input.release();
                            ctx.forward_complete(next_id);
                            return Ok(());
                        }
                        SlotState::Dropped => {}
                        SlotState::Ready(mut out) => {
                            out.copy_from(&input).map_err(|e| worker_error!(e))?;
                            let (samples, t_ns) = (out.head, out.t_ns);
                            match out.submit() {
                                Ok(()) => ctx.stats().record_out(samples, t_ns),
                                Err(SluiceError::Stopped) => {
                                    input.release();
                                    ctx.forward_complete(next_id);
                                    return Ok(());
                                }
                                Err(err) => return Err(worker_error!(err)),
                            }
                        }
                    }
                }

                input.release();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::BatchRing;
    use std::sync::Arc;

    fn out_ring(name: &str, ring_expo: u32, policy: OverflowPolicy) -> Arc<BatchRing> {
        let ring = BatchRing::new(
            RingConfig::new(name, SampleType::F32)
                .with_ring_expo(ring_expo)
                .unwrap()
                .with_overflow_policy(policy),
        )
        .unwrap();
        ring.start();
        ring
    }

    fn feed(ring: &BatchRing, value: f32, batch_id: u64) {
        let mut slot = ring.get_head(Duration::from_millis(500)).unwrap();
        slot.samples_mut::<f32>().unwrap()[0] = value;
        slot.set_head(1).unwrap();
        slot.batch_id = batch_id;
        slot.submit().unwrap();
    }

    #[test]
    fn test_rejects_shared_ownership_config() {
        let mut config = TeeConfig::new("tee", SampleType::F32);
        config.copy_data = false;
        assert!(matches!(
            Tee::new(config),
            Err(SluiceError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_start_requires_two_sinks() {
        let mut tee = Tee::new(TeeConfig::new("tee", SampleType::F32)).unwrap();
        assert!(matches!(tee.start(), Err(SluiceError::NoSink { .. })));

        tee.connect_sink(0, out_ring("a", 4, OverflowPolicy::Block))
            .unwrap();
        assert!(matches!(tee.start(), Err(SluiceError::NoSink { .. })));
    }

    #[test]
    fn test_broadcasts_to_all_outputs() {
        let mut tee = Tee::new(TeeConfig::new("tee", SampleType::F32)).unwrap();
        let a = out_ring("a", 4, OverflowPolicy::Block);
        let b = out_ring("b", 4, OverflowPolicy::Block);
        tee.connect_sink(0, Arc::clone(&a)).unwrap();
        tee.connect_sink(1, Arc::clone(&b)).unwrap();
        tee.start().unwrap();

        let input = tee.input_ring(0).unwrap();
        for i in 0..4 {
            feed(&input, i as f32, i);
        }

        for ring in [&a, &b] {
            for i in 0..4 {
                let batch = ring.get_tail(Duration::from_millis(500)).unwrap();
                assert_eq!(batch.batch_id, i);
                assert_eq!(batch.samples::<f32>().unwrap()[0], i as f32);
                batch.release();
            }
        }

        tee.stop().unwrap();
        assert!(tee.worker_err().is_none());
    }

    #[test]
    fn test_slow_output_drops_without_blocking_priority_path() {
        let mut tee = Tee::new(TeeConfig::new("tee", SampleType::F32)).unwrap();
        let fast = out_ring("fast", 4, OverflowPolicy::Block);
        // Depth-2 ring that rejects when full and nobody drains it
        let slow = out_ring("slow", 1, OverflowPolicy::DropHead);
        tee.connect_sink(0, Arc::clone(&fast)).unwrap();
        tee.connect_sink(1, Arc::clone(&slow)).unwrap();
        tee.start().unwrap();

        let input = tee.input_ring(0).unwrap();
        for i in 0..10 {
            feed(&input, i as f32, i);
        }

        // Priority path receives everything
        for i in 0..10 {
            let batch = fast.get_tail(Duration::from_millis(500)).unwrap();
            assert_eq!(batch.batch_id, i);
            batch.release();
        }

        tee.stop().unwrap();
        assert!(tee.worker_err().is_none());

        assert!(slow.occupancy() <= 2);
        let stats = tee.get_stats();
        assert!(
            stats.dropped_batches[1] >= 8,
            "paused output dropped at least 8, got {}",
            stats.dropped_batches[1]
        );
        assert_eq!(stats.dropped_batches[0], 0);
    }

    #[test]
    fn test_complete_reaches_every_output() {
        let mut tee = Tee::new(TeeConfig::new("tee", SampleType::F32)).unwrap();
        let a = out_ring("a", 4, OverflowPolicy::Block);
        let b = out_ring("b", 4, OverflowPolicy::Block);
        tee.connect_sink(0, Arc::clone(&a)).unwrap();
        tee.connect_sink(1, Arc::clone(&b)).unwrap();
        tee.start().unwrap();

        let input = tee.input_ring(0).unwrap();
        feed(&input, 1.0, 0);
        {
            let mut slot = input.get_head(Duration::from_millis(500)).unwrap();
            slot.mark_complete();
            slot.batch_id = 1;
            slot.submit().unwrap();
        }

        for ring in [&a, &b] {
            let data = ring.get_tail(Duration::from_millis(500)).unwrap();
            assert!(!data.is_complete());
            data.release();
            let sentinel = ring.get_tail(Duration::from_millis(500)).unwrap();
            assert!(sentinel.is_complete());
            sentinel.release();
        }

        tee.stop().unwrap();
        assert!(tee.worker_err().is_none());
    }

    #[test]
    fn test_output_capacity_must_match_input() {
        let mut tee = Tee::new(TeeConfig::new("tee", SampleType::F32)).unwrap();
        let mismatched = BatchRing::new(
            RingConfig::new("small", SampleType::F32)
                .with_batch_expo(3)
                .unwrap(),
        )
        .unwrap();
        assert!(matches!(
            tee.connect_sink(0, mismatched),
            Err(SluiceError::TypeMismatch { .. })
        ));
    }
}
