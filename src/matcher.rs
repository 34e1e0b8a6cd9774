//! BatchMatcher - realigns variable-sized input batches onto a fixed cadence
//!
//! Upstream stages emit batches of `Ci` samples; downstream requires exactly
//! `Co` samples per batch with timestamps aligned to `Co * period_ns`. The
//! matcher decouples the two sizes while preserving timing: it accumulates
//! input samples straight into the next output slot and publishes whenever
//! the slot reaches `Co`.
//!
//! `Ci` comes from the owned input ring; `Co` comes from the ring bound to
//! the single sink. Regular timing (`period_ns > 0`) and integer phase
//! (`t_ns % period_ns == 0`) are required of the first observed batch; a
//! misaligned stream records `PhaseError` before any output is produced.

use std::time::Duration;

use crate::batch::SampleType;
use crate::constants::{DEFAULT_BATCH_EXPO, DEFAULT_OP_TIMEOUT, DEFAULT_RING_EXPO};
use crate::error::{ErrorCode, Result, SluiceError};
use crate::filter::{Filter, FilterCore, FilterKind, SinkRequirements, SlotState};
use crate::properties::{ConstraintOp, PropertyConstraint, PropertyId, PropertyValue};
use crate::ring::{OverflowPolicy, ProduceGuard, RingConfig};
use crate::worker_error;

/// Configuration for a [`BatchMatcher`] filter
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MatcherConfig {
    /// Filter name; the input ring is named `<name>.in`
    pub name: String,
    /// Element type carried through
    pub dtype: SampleType,
    /// Input ring batch capacity (`Ci`) is `2^batch_expo` samples
    pub batch_expo: u32,
    /// Input ring depth is `2^ring_expo` slots
    pub ring_expo: u32,
    /// Overflow policy of the owned input ring
    pub overflow_policy: OverflowPolicy,
    /// Blocking budget for the worker's ring operations
    pub timeout: Duration,
}

impl MatcherConfig {
    /// Defaults: 64-sample input batches, 16-slot blocking ring
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
}

/// Realigns input batches onto the sink ring's batch size and phase
pub struct BatchMatcher {
    core: FilterCore,
    dtype: SampleType,
}

impl BatchMatcher {
    /// Allocate the filter and its owned input ring
    pub fn new(config: MatcherConfig) -> Result<Self> {
        let ring_config = RingConfig {
            name: format!("{}.in", config.name),
            dtype: config.dtype,
            batch_expo: config.batch_expo,
            ring_expo: config.ring_expo,
            overflow_policy: config.overflow_policy,
        };
        ring_config.validate()?;
        let core = FilterCore::new(
            config.name,
            FilterKind::Matcher,
            vec![ring_config],
            1,
            config.timeout,
        )?;
        Ok(Self {
            core,
            dtype: config.dtype,
        })
    }
}

impl Filter for BatchMatcher {
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
        // Co is whatever the sink ring carries; only the dtype is pinned
        Ok(SinkRequirements::any_capacity(self.dtype))
    }

    fn input_constraints(&self) -> Vec<PropertyConstraint> {
        vec![PropertyConstraint::all_ports(
            PropertyId::Regular,
            ConstraintOp::Eq,
            Some(PropertyValue::Bool(true)),
        )]
    }

    fn start(&mut self) -> Result<()> {
        let Some(sink) = self.core.sink(0) else {
            return Err(SluiceError::NoSink {
                filter: self.core.name().to_string(),
            });
        };
        let co = sink.batch_capacity();
        let elem = self.dtype.size_bytes();

        self.core.start_worker(move |ctx| {
            // Stream state established by the first batch
            let mut period_ns = 0u64;
            let mut t_start = 0u64;
            let mut skip_samples = 0u64;

            // Accumulator: the reserved output slot plus its fill count
            let mut out: Option<ProduceGuard<'_>> = None;
            let mut fill = 0usize;
            let mut out_id = 0u64;
            let mut first = true;

            loop {
                let Some(input) = ctx.next_input(0)? else {
                    return Ok(());
                };

                if input.is_complete() {
                    // Publish the partial accumulator, then the sentinel
                    if let Some(mut slot) = out.take() {
                        if fill > 0 {
                            slot.set_head(fill).map_err(|e| worker_error!(e))?;
                            slot.t_ns = t_start + out_id * co as u64 * period_ns;
                            slot.period_ns = period_ns;
                            slot.batch_id = out_id;
                            let t_ns = slot.t_ns;
                            match slot.submit() {
                                Ok(()) => {
                                    ctx.stats().record_out(fill, t_ns);
                                    out_id += 1;
                                }
                                Err(SluiceError::Stopped) => {}
                                Err(err) => return Err(worker_error!(err)),
                            }
                        }
                    }
                    ctx.forward_complete(out_id);
                    input.release();
                    return Ok(());
                }

                if first {
                    period_ns = input.period_ns;
                    if period_ns == 0 {
                        return Err(worker_error!(
                            ErrorCode::InvalidData,
                            "matcher requires regular timing, got period_ns == 0"
                        ));
                    }
                    if input.t_ns % period_ns != 0 {
                        return Err(worker_error!(SluiceError::PhaseError {
                            t_ns: input.t_ns,
                            period_ns,
                        }));
                    }
                    // Align up to the output cadence; earlier samples are discarded
                    let span = co as u64 * period_ns;
                    t_start = input.t_ns.next_multiple_of(span);
                    skip_samples = (t_start - input.t_ns) / period_ns;
                    first = false;
                }

                ctx.stats().record_in(input.head);

                let src_len = input.head * elem;
                let mut offset = 0usize;

                // Discard samples ahead of the aligned start
                if skip_samples > 0 {
                    let discard = (skip_samples as usize).min(input.head);
                    offset = discard * elem;
                    skip_samples -= discard as u64;
                }

                while offset < src_len {
                    if out.is_none() {
                        match ctx.output_slot(0)? {
                            SlotState::Ready(slot) => {
                                fill = 0;
                                out = Some(slot);
                            }
                            SlotState::Dropped => {
                                // Whole remainder of this input batch is lost
                                break;
                            }
                            SlotState::Stopped => {
                                input.release();
                                return Ok(());
                            }
                        }
                    }

                    {
                        let slot = out.as_mut().expect("accumulator present");
                        let want = (co - fill) * elem;
                        let take = want.min(src_len - offset);
                        slot.raw_bytes_mut()[fill * elem..fill * elem + take]
                            .copy_from_slice(&input.valid_bytes()[offset..offset + take]);
                        fill += take / elem;
                        offset += take;
                    }

                    if fill == co {
                        let mut slot = out.take().expect("accumulator present");
                        slot.set_head(co).map_err(|e| worker_error!(e))?;
                        slot.t_ns = t_start + out_id * co as u64 * period_ns;
                        slot.period_ns = period_ns;
                        slot.batch_id = out_id;
                        let t_ns = slot.t_ns;
                        match slot.submit() {
                            Ok(()) => {
                                ctx.stats().record_out(co, t_ns);
                                out_id += 1;
                                fill = 0;
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
    use crate::filter::Filter;
    use crate::ring::{BatchRing, RingConfig};
    use std::sync::Arc;

    fn sink_ring(batch_expo: u32) -> Arc<BatchRing> {
        let ring = BatchRing::new(
            RingConfig::new("matched", SampleType::F32)
                .with_batch_expo(batch_expo)
                .unwrap()
                .with_ring_expo(4)
                .unwrap(),
        )
        .unwrap();
        ring.start();
        ring
    }

    fn matcher(batch_expo: u32) -> BatchMatcher {
        let mut config = MatcherConfig::new("match", SampleType::F32);
        config.batch_expo = batch_expo;
        BatchMatcher::new(config).unwrap()
    }

    fn feed(ring: &BatchRing, values: &[f32], t_ns: u64, period_ns: u64, batch_id: u64) {
        let mut slot = ring.get_head(Duration::from_millis(500)).unwrap();
        slot.samples_mut::<f32>().unwrap()[..values.len()].copy_from_slice(values);
        slot.set_head(values.len()).unwrap();
        slot.t_ns = t_ns;
        slot.period_ns = period_ns;
        slot.batch_id = batch_id;
        slot.submit().unwrap();
    }

    fn feed_complete(ring: &BatchRing) {
        let mut slot = ring.get_head(Duration::from_millis(500)).unwrap();
        slot.mark_complete();
        slot.submit().unwrap();
    }

    fn drain_one(ring: &BatchRing) -> (Vec<f32>, u64, u64) {
        let batch = ring.get_tail(Duration::from_millis(500)).unwrap();
        let samples = batch.samples::<f32>().unwrap().to_vec();
        let result = (samples, batch.t_ns, batch.batch_id);
        batch.release();
        result
    }

    #[test]
    fn test_shrinking_realignment() {
        // 256-sample input split into four 64-sample outputs
        let mut filter = matcher(8);
        let out = sink_ring(6);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        let values: Vec<f32> = (0..256).map(|i| i as f32).collect();
        feed(&input, &values, 0, 1_000, 0);

        for k in 0..4u64 {
            let (samples, t_ns, batch_id) = drain_one(&out);
            assert_eq!(samples.len(), 64);
            assert_eq!(samples[0], (k * 64) as f32);
            assert_eq!(samples[63], (k * 64 + 63) as f32);
            assert_eq!(t_ns, k * 64_000);
            assert_eq!(batch_id, k);
        }

        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }

    #[test]
    fn test_growing_realignment() {
        // Eight 16-sample inputs merged into two 64-sample outputs
        let mut filter = matcher(4);
        let out = sink_ring(6);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        for i in 0..8u64 {
            let values: Vec<f32> = (i * 16..(i + 1) * 16).map(|v| v as f32).collect();
            feed(&input, &values, i * 16_000, 1_000, i);
        }

        let (first, t0, id0) = drain_one(&out);
        assert_eq!(first.len(), 64);
        assert_eq!(first[0], 0.0);
        assert_eq!(first[63], 63.0);
        assert_eq!(t0, 0);
        assert_eq!(id0, 0);

        let (second, t1, id1) = drain_one(&out);
        assert_eq!(second[0], 64.0);
        assert_eq!(second[63], 127.0);
        assert_eq!(t1, 64_000);
        assert_eq!(id1, 1);

        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }

    #[test]
    fn test_matched_sizes_forward_identically() {
        let mut filter = matcher(6);
        let out = sink_ring(6);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
        feed(&input, &values, 128_000, 1_000, 2);

        let (samples, t_ns, _) = drain_one(&out);
        assert_eq!(samples, values);
        assert_eq!(t_ns, 128_000);

        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }

    #[test]
    fn test_phase_error_before_any_output() {
        let mut filter = matcher(6);
        let out = sink_ring(6);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
        feed(&input, &values, 12_345_000, 1_000_000, 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while filter.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!filter.is_running());
        let err = filter.worker_err().expect("phase error recorded");
        assert_eq!(err.code, ErrorCode::PhaseError);
        assert!(out.is_empty(), "no output before the phase check");

        filter.stop().unwrap();
    }

    #[test]
    fn test_complete_flushes_partial_accumulator() {
        let mut filter = matcher(4);
        let out = sink_ring(6);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
        feed(&input, &values, 0, 1_000, 0);
        feed_complete(&input);

        let partial = out.get_tail(Duration::from_millis(500)).unwrap();
        assert_eq!(partial.head, 16);
        assert_eq!(partial.t_ns, 0);
        assert_eq!(partial.ec, ErrorCode::Ok);
        partial.release();

        let sentinel = out.get_tail(Duration::from_millis(500)).unwrap();
        assert!(sentinel.is_complete());
        sentinel.release();

        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }

    #[test]
    fn test_unaligned_start_discards_leading_samples() {
        // First batch starts one output-cadence sample late; the aligned
        // start is the next 64-sample boundary
        let mut filter = matcher(6);
        let out = sink_ring(6);
        filter.connect_sink(0, Arc::clone(&out)).unwrap();
        filter.start().unwrap();

        let input = filter.input_ring(0).unwrap();
        // t = 32_000 with period 1_000: aligned start is t = 64_000, so the
        // first 32 samples are discarded
        let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
        feed(&input, &values, 32_000, 1_000, 0);
        let values2: Vec<f32> = (64..128).map(|i| i as f32).collect();
        feed(&input, &values2, 96_000, 1_000, 1);
        feed_complete(&input);

        let (samples, t_ns, _) = drain_one(&out);
        assert_eq!(t_ns, 64_000);
        assert_eq!(samples.len(), 64);
        assert_eq!(samples[0], 32.0, "samples before the aligned start discarded");
        assert_eq!(samples[63], 95.0);

        filter.stop().unwrap();
        assert!(filter.worker_err().is_none());
    }
}
