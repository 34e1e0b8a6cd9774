//! Passthrough - matched-size 1→1 forwarder
//!
//! Copies every input batch to its single sink with metadata intact. The
//! smallest useful filter, and the reference implementation of the standard
//! worker loop every built-in stage follows.

use std::sync::Arc;
use std::time::Duration;

use crate::batch::SampleType;
use crate::constants::{DEFAULT_BATCH_EXPO, DEFAULT_OP_TIMEOUT, DEFAULT_RING_EXPO};
use crate::error::{Result, SluiceError};
use crate::filter::{Filter, FilterCore, FilterKind, SinkRequirements, SlotState};
use crate::ring::{OverflowPolicy, RingConfig};
use crate::worker_error;

/// Configuration for a [`Passthrough`] filter
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PassthroughConfig {
    /// Filter name; the input ring is named `<name>.in`
    pub name: String,
    /// Element type forwarded
    pub dtype: SampleType,
    /// Input ring batch capacity is `2^batch_expo` samples
    pub batch_expo: u32,
    /// Input ring depth is `2^ring_expo` slots
    pub ring_expo: u32,
    /// Overflow policy of the owned input ring
    pub overflow_policy: OverflowPolicy,
    /// Blocking budget for the worker's ring operations
    pub timeout: Duration,
}

impl PassthroughConfig {
    /// Defaults: 64-sample batches, 16-slot blocking ring
    pub fn new(name: impl Into<String>, dtype: SampleType) -> Self {
        Self {
            name: name.into(),
            dtype,
            batch_expo: DEFAULT_BATCH_EXPO,
            ring_expo: DEFAULT_RING_EXPO,
            overflow_policy: OverflowPolicy::Block,
            timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    fn input_ring_config(&self) -> RingConfig {
        RingConfig {
            name: format!("{}.in", self.name),
            dtype: self.dtype,
            batch_expo: self.batch_expo,
            ring_expo: self.ring_expo,
            overflow_policy: self.overflow_policy,
        }
    }
}

/// Matched-size 1→1 forwarder
pub struct Passthrough {
    core: FilterCore,
    dtype: SampleType,
    batch_capacity: usize,
}

impl Passthrough {
    /// Allocate the filter and its owned input ring
    pub fn new(config: PassthroughConfig) -> Result<Self> {
        let ring_config = config.input_ring_config();
        ring_config.validate()?;
        let batch_capacity = ring_config.batch_capacity();
        let core = FilterCore::new(
            config.name,
            FilterKind::Passthrough,
            vec![ring_config],
            1,
            config.timeout,
        )?;
        Ok(Self {
            core,
            dtype: config.dtype,
            batch_capacity,
        })
    }
}

impl Filter for Passthrough {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn sink_requirements(&self, port: usize) -> Result<SinkRequirements> {
        if port != 0 {
            return Err(SluiceError::InvalidSinkIdx { index: port, max: 1 });
        }
        Ok(SinkRequirements::exact(self.dtype, self.batch_capacity))
    }

    fn start(&mut self) -> Result<()> {
        if self.core.sink(0).is_none() {
            return Err(SluiceError::NoSink {
                filter: self.core.name().to_string(),
            });
        }
        self.core.start_worker(|ctx| {
            loop {
                let Some(input) = ctx.next_input(0)? else {
                    return Ok(());
                };
                if input.is_complete() {
                    ctx.forward_complete(input.batch_id);
                    input.release();
                    return Ok(());
                }

                let samples_in = input.head;
                match ctx.output_slot(0)? {
                    SlotState::Stopped => {
                        input.release();
                        return Ok(());
                    }
                    SlotState::Dropped => {
                        ctx.stats().record_in(samples_in);
                        input.release();
                        continue;
                    }
                    SlotState::Ready(mut out) => {
                        out.copy_from(&input).map_err(|e| worker_error!(e))?;
                        let t_ns = out.t_ns;
                        match out.submit() {
                            Ok(()) => {
                                ctx.stats().record_in(samples_in);
                                ctx.stats().record_out(samples_in, t_ns);
                            }
                            Err(SluiceError::Stopped) => {
                                input.release();
                                return Ok(());
                            }
                            Err(err) => return Err(worker_error!(err)),
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
    use crate::batch::Batch;
    use crate::error::ErrorCode;
    use crate::ring::BatchRing;

    fn sink_ring(batch_expo: u32) -> Arc<BatchRing> {
        let ring = BatchRing::new(
            RingConfig::new("out", SampleType::F32)
                .with_batch_expo(batch_expo)
                .unwrap(),
        )
        .unwrap();
        ring.start();
        ring
    }

    fn feed(ring: &BatchRing, values: &[f32], t_ns: u64, period_ns: u64, batch_id: u64) {
        let mut slot = ring.get_head(Duration::from_millis(200)).unwrap();
        slot.samples_mut::<f32>().unwrap()[..values.len()].copy_from_slice(values);
        slot.set_head(values.len()).unwrap();
        slot.t_ns = t_ns;
        slot.period_ns = period_ns;
        slot.batch_id = batch_id;
        slot.submit().unwrap();
    }

    #[test]
    fn test_start_requires_sink() {
        let mut filter =
            Passthrough::new(PassthroughConfig::new("lonely", SampleType::F32)).unwrap();
        assert!(matches!(filter.start(), Err(SluiceError::NoSink { .. })));
    }

    #[test]
    fn test_forwards_batches_with_metadata() {
        let mut filter = Passthrough::new(PassthroughConfig::new("fwd", SampleType::F32)).unwrap();
        let out = sink_ring(DEFAULT_BATCH_EXPO);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        feed(&input, &[1.0, 2.0, 3.0], 7_000, 1_000, 11);

        let batch = out.get_tail(Duration::from_millis(500)).unwrap();
        assert_eq!(batch.samples::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(batch.t_ns, 7_000);
        assert_eq!(batch.period_ns, 1_000);
        assert_eq!(batch.batch_id, 11);
        batch.release();

        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }

    #[test]
    fn test_complete_propagates_and_worker_exits() {
        let mut filter = Passthrough::new(PassthroughConfig::new("eos", SampleType::F32)).unwrap();
        let out = sink_ring(DEFAULT_BATCH_EXPO);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        feed(&input, &[5.0], 0, 1_000, 0);
        {
            let mut slot = input.get_head(Duration::from_millis(200)).unwrap();
            slot.mark_complete();
            slot.batch_id = 1;
            slot.submit().unwrap();
        }

        let data = out.get_tail(Duration::from_millis(500)).unwrap();
        assert_eq!(data.ec, ErrorCode::Ok);
        data.release();
        let sentinel = out.get_tail(Duration::from_millis(500)).unwrap();
        assert!(sentinel.is_complete());
        sentinel.release();

        // Worker winds itself down after the sentinel
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while filter.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!filter.is_running());
        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }

    #[test]
    fn test_batch_type_roundtrip_through_ring_slots() {
        // copy_from between independently allocated batches matches ring slots
        let mut a = Batch::new(SampleType::F32, 8);
        a.samples_mut::<f32>().unwrap()[..2].copy_from_slice(&[9.0, 8.0]);
        a.set_head(2).unwrap();
        let mut b = Batch::new(SampleType::F32, 8);
        b.copy_from(&a).unwrap();
        assert_eq!(b.samples::<f32>().unwrap(), &[9.0, 8.0]);
    }
}
