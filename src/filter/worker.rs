//! Worker thread harness and failure channel
//!
//! Every filter runs one worker on a dedicated OS thread. The worker observes
//! shutdown cooperatively: any ring operation returning `Stopped`, or the
//! filter's stop flag, makes it drain and return. A worker that fails records
//! a structured [`WorkerError`] before returning; the host reads it after
//! join. Workers never retry policy decisions and never log data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::constants::SHUTDOWN_FLUSH_TIMEOUT;
use crate::error::{ErrorCode, Result, SluiceError};
use crate::filter::stats::FilterStats;
use crate::ring::{BatchRing, ConsumeGuard, ProduceGuard};

/// Structured record of a worker failure, written once before the thread returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    /// Stable ordinal of the failure
    pub code: ErrorCode,
    /// Source file that recorded the failure
    pub file: &'static str,
    /// Source line that recorded the failure
    pub line: u32,
    /// Module path of the recording site
    pub function: &'static str,
    /// Human-readable description
    pub message: String,
}

impl WorkerError {
    /// Build a record; prefer the [`worker_error!`](crate::worker_error) macro
    /// which captures the call site.
    pub fn new(
        code: ErrorCode,
        file: &'static str,
        line: u32,
        function: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            file,
            line,
            function,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} at {}:{} ({}): {}",
            self.code, self.file, self.line, self.function, self.message
        )
    }
}

/// Build a [`WorkerError`] capturing the call site.
///
/// Accepts either a `SluiceError` or an explicit code plus format string.
#[macro_export]
macro_rules! worker_error {
    ($err:expr) => {{
        let err = $err;
        $crate::filter::worker::WorkerError::new(
            err.code(),
            file!(),
            line!(),
            module_path!(),
            err.to_string(),
        )
    }};
    ($code:expr, $($arg:tt)*) => {
        $crate::filter::worker::WorkerError::new(
            $code,
            file!(),
            line!(),
            module_path!(),
            format!($($arg)*),
        )
    };
}

/// Outcome of acquiring an output slot under the sink ring's overflow policy
#[derive(Debug)]
pub enum SlotState<'a> {
    /// Slot reserved and ready to fill
    Ready(ProduceGuard<'a>),
    /// Ring full under a drop policy; the batch was counted as dropped
    Dropped,
    /// Stop observed; the worker should exit
    Stopped,
}

/// Everything a worker needs, moved onto its thread at start
pub struct WorkerContext {
    name: String,
    inputs: Vec<Arc<BatchRing>>,
    sinks: Vec<Option<Arc<BatchRing>>>,
    stop: Arc<AtomicBool>,
    timeout: Duration,
    stats: Arc<FilterStats>,
}

impl WorkerContext {
    pub(crate) fn new(
        name: String,
        inputs: Vec<Arc<BatchRing>>,
        sinks: Vec<Option<Arc<BatchRing>>>,
        stop: Arc<AtomicBool>,
        timeout: Duration,
        stats: Arc<FilterStats>,
    ) -> Self {
        Self {
            name,
            inputs,
            sinks,
            stop,
            timeout,
            stats,
        }
    }

    /// Filter name, for diagnostics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the owning filter requested stop
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The filter's counters
    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    /// Input ring at `port`
    pub fn input(&self, port: usize) -> &Arc<BatchRing> {
        &self.inputs[port]
    }

    /// Sink ring bound at `port`, if any
    pub fn sink(&self, port: usize) -> Option<&Arc<BatchRing>> {
        self.sinks.get(port).and_then(|s| s.as_ref())
    }

    /// Bound sinks in port order
    pub fn bound_sinks(&self) -> impl Iterator<Item = (usize, &Arc<BatchRing>)> {
        self.sinks
            .iter()
            .enumerate()
            .filter_map(|(port, sink)| sink.as_ref().map(|ring| (port, ring)))
    }

    /// Await the next batch on input `port`.
    ///
    /// `Ok(None)` means stop was observed (ring stopped or stop flag set);
    /// the worker should drain and return. Timeouts re-check the stop flag
    /// and retry.
    pub fn next_input(
        &self,
        port: usize,
    ) -> std::result::Result<Option<ConsumeGuard<'_>>, WorkerError> {
        let ring = &self.inputs[port];
        loop {
            if self.stop_requested() {
                return Ok(None);
            }
            match ring.get_tail(self.timeout) {
                Ok(guard) => return Ok(Some(guard)),
                Err(SluiceError::Timeout) => {
                    self.stats.record_timeout();
                }
                Err(SluiceError::Stopped) => return Ok(None),
                Err(err) => return Err(worker_error!(err)),
            }
        }
    }

    /// Reserve an output slot at sink `port` under that ring's policy.
    ///
    /// Blocking rings wait in timeout slices, re-checking the stop flag
    /// between slices. `NoSpace` under a drop policy is counted against the
    /// port and reported as [`SlotState::Dropped`].
    pub fn output_slot(&self, port: usize) -> std::result::Result<SlotState<'_>, WorkerError> {
        let Some(ring) = self.sink(port) else {
            return Err(worker_error!(SluiceError::NoSink {
                filter: self.name.clone(),
            }));
        };
        loop {
            if self.stop_requested() {
                return Ok(SlotState::Stopped);
            }
            match ring.get_head(self.timeout) {
                Ok(guard) => return Ok(SlotState::Ready(guard)),
                Err(SluiceError::Timeout) => {
                    self.stats.record_timeout();
                }
                Err(SluiceError::NoSpace) => {
                    self.stats.record_drop(port);
                    return Ok(SlotState::Dropped);
                }
                Err(SluiceError::Stopped) => return Ok(SlotState::Stopped),
                Err(err) => return Err(worker_error!(err)),
            }
        }
    }

    /// Forward the end-of-stream sentinel to every bound sink, best effort.
    ///
    /// Each sink gets one bounded attempt; a full or stopped sink simply
    /// misses the sentinel (its own stop path covers shutdown).
    pub fn forward_complete(&self, batch_id: u64) {
        for (port, ring) in self.bound_sinks() {
            match ring.get_head(SHUTDOWN_FLUSH_TIMEOUT) {
                Ok(mut slot) => {
                    slot.mark_complete();
                    slot.batch_id = batch_id;
                    if slot.submit().is_err() {
                        trace!(
                            filter = %self.name,
                            port,
                            "sink stopped before sentinel could be published"
                        );
                    }
                }
                Err(err) => {
                    trace!(
                        filter = %self.name,
                        port,
                        %err,
                        "could not forward completion sentinel"
                    );
                }
            }
        }
    }
}

/// Spawn a filter worker thread.
///
/// The harness owns the exit protocol: a failing body writes `worker_err`
/// exactly once, and `running` is cleared on every path out.
pub(crate) fn spawn_worker<F>(
    thread_name: String,
    running: Arc<AtomicBool>,
    worker_err: Arc<Mutex<Option<WorkerError>>>,
    ctx: WorkerContext,
    body: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce(&WorkerContext) -> std::result::Result<(), WorkerError> + Send + 'static,
{
    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            match body(&ctx) {
                Ok(()) => {
                    trace!(filter = %ctx.name, "worker exited cleanly");
                }
                Err(err) => {
                    warn!(filter = %ctx.name, code = ?err.code, message = %err.message, "worker failed");
                    *worker_err.lock() = Some(err);
                }
            }
            running.store(false, Ordering::Release);
        })
        .map_err(|e| SluiceError::thread(format!("failed to spawn worker: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SampleType;
    use crate::ring::{OverflowPolicy, RingConfig};

    fn context(policy: OverflowPolicy) -> WorkerContext {
        let input = BatchRing::new(
            RingConfig::new("in", SampleType::F32)
                .with_ring_expo(1)
                .unwrap(),
        )
        .unwrap();
        let sink = BatchRing::new(
            RingConfig::new("out", SampleType::F32)
                .with_ring_expo(1)
                .unwrap()
                .with_overflow_policy(policy),
        )
        .unwrap();
        input.start();
        sink.start();
        WorkerContext::new(
            "ctx".to_string(),
            vec![input],
            vec![Some(sink)],
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(10),
            Arc::new(FilterStats::new(1)),
        )
    }

    #[test]
    fn test_next_input_returns_none_on_stop_flag() {
        let ctx = context(OverflowPolicy::Block);
        ctx.stop.store(true, Ordering::Release);
        assert!(ctx.next_input(0).unwrap().is_none());
    }

    #[test]
    fn test_next_input_returns_none_on_stopped_ring() {
        let ctx = context(OverflowPolicy::Block);
        ctx.input(0).stop();
        assert!(ctx.next_input(0).unwrap().is_none());
    }

    #[test]
    fn test_output_slot_reports_drop() {
        let ctx = context(OverflowPolicy::DropHead);
        // Fill both slots of the depth-2 sink
        for _ in 0..2 {
            let slot = ctx.sink(0).unwrap().get_head(Duration::ZERO).unwrap();
            slot.submit().unwrap();
        }
        match ctx.output_slot(0).unwrap() {
            SlotState::Dropped => {}
            _ => panic!("expected Dropped"),
        }
        assert_eq!(ctx.stats().dropped_at(0), 1);
    }

    #[test]
    fn test_output_slot_without_sink_is_worker_error() {
        let mut ctx = context(OverflowPolicy::Block);
        ctx.sinks[0] = None;
        let err = ctx.output_slot(0).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSink);
    }

    #[test]
    fn test_forward_complete_publishes_sentinel() {
        let ctx = context(OverflowPolicy::Block);
        ctx.forward_complete(3);
        let sink = ctx.sink(0).unwrap();
        let batch = sink.get_tail(Duration::ZERO).unwrap();
        assert!(batch.is_complete());
        assert_eq!(batch.batch_id, 3);
        assert_eq!(batch.head, 0);
        batch.release();
    }

    #[test]
    fn test_worker_error_macro_captures_site() {
        let err = worker_error!(SluiceError::Timeout);
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.file.ends_with("worker.rs"));
        assert!(err.line > 0);

        let err = worker_error!(ErrorCode::PhaseError, "t_ns {} misaligned", 12_345);
        assert_eq!(err.code, ErrorCode::PhaseError);
        assert!(err.message.contains("12345"));
    }
}
