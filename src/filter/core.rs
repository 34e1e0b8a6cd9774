//! Shared base state composed into every filter
//!
//! `FilterCore` owns the input rings, the sink table, the worker handle, and
//! the failure channel. Concrete filters delegate the uniform lifecycle and
//! connection bookkeeping here and contribute only their worker body and
//! connection requirements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, SluiceError};
use crate::filter::stats::{FilterStats, StatsSnapshot};
use crate::filter::worker::{self, WorkerContext, WorkerError};
use crate::filter::FilterKind;
use crate::properties::PropertyTable;
use crate::ring::{BatchRing, RingConfig};
use crate::worker_error;

/// Base state shared by every filter implementation
pub struct FilterCore {
    name: String,
    kind: FilterKind,
    timeout: Duration,

    inputs: Vec<Arc<BatchRing>>,
    sinks: Vec<Option<Arc<BatchRing>>>,

    input_props: Vec<PropertyTable>,
    output_props: Vec<PropertyTable>,

    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    worker_err: Arc<Mutex<Option<WorkerError>>>,
    stats: Arc<FilterStats>,
}

impl FilterCore {
    /// Allocate base state and the filter's owned input rings
    pub fn new(
        name: impl Into<String>,
        kind: FilterKind,
        input_configs: Vec<RingConfig>,
        max_sinks: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(SluiceError::config("filter name must not be empty"));
        }
        let inputs = input_configs
            .into_iter()
            .map(BatchRing::new)
            .collect::<Result<Vec<_>>>()?;
        let num_inputs = inputs.len();
        Ok(Self {
            name,
            kind,
            timeout,
            inputs,
            sinks: vec![None; max_sinks],
            input_props: vec![PropertyTable::new(); num_inputs],
            output_props: vec![PropertyTable::new(); max_sinks],
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            worker_err: Arc::new(Mutex::new(None)),
            stats: Arc::new(FilterStats::new(max_sinks)),
        })
    }

    // ---------------------------------------------------------------------
    // ACCESSORS
    // ---------------------------------------------------------------------

    /// Filter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filter kind tag
    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Default blocking budget for the worker's ring operations
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Owned input rings
    pub fn inputs(&self) -> &[Arc<BatchRing>] {
        &self.inputs
    }

    /// Owned input ring at `port`
    pub fn input_ring(&self, port: usize) -> Result<Arc<BatchRing>> {
        self.inputs
            .get(port)
            .cloned()
            .ok_or(SluiceError::InvalidSinkIdx {
                index: port,
                max: self.inputs.len(),
            })
    }

    /// Sink ring bound at `port`, if any
    pub fn sink(&self, port: usize) -> Option<Arc<BatchRing>> {
        self.sinks.get(port).and_then(|s| s.clone())
    }

    /// Number of sink ports
    pub fn max_sinks(&self) -> usize {
        self.sinks.len()
    }

    /// Number of currently bound sinks
    pub fn sinks_bound(&self) -> usize {
        self.sinks.iter().filter(|s| s.is_some()).count()
    }

    /// True while the worker is alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The failure recorded by the worker, if any
    pub fn worker_err(&self) -> Option<WorkerError> {
        self.worker_err.lock().clone()
    }

    /// Snapshot of the filter's counters
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Properties recorded for input `port` at connect time
    pub fn input_properties(&self, port: usize) -> Option<&PropertyTable> {
        self.input_props.get(port)
    }

    /// All input property tables in port order
    pub fn input_property_tables(&self) -> Vec<&PropertyTable> {
        self.input_props.iter().collect()
    }

    /// Record the property table arriving on input `port`
    pub fn set_input_properties(&mut self, port: usize, table: PropertyTable) {
        if let Some(slot) = self.input_props.get_mut(port) {
            *slot = table;
        }
    }

    /// Explicitly known output properties for `port` (e.g. set by config)
    pub fn output_properties(&self, port: usize) -> Option<&PropertyTable> {
        self.output_props.get(port)
    }

    /// Record explicit output knowledge for `port`
    pub fn set_output_properties(&mut self, port: usize, table: PropertyTable) {
        if let Some(slot) = self.output_props.get_mut(port) {
            *slot = table;
        }
    }

    /// Merged knowledge across every input port
    pub fn merged_input_properties(&self) -> PropertyTable {
        let mut merged = PropertyTable::new();
        for table in &self.input_props {
            merged.merge_from(table);
        }
        merged
    }

    // ---------------------------------------------------------------------
    // CONNECTIONS
    // ---------------------------------------------------------------------

    /// Bind a sink ring at `port`; index and occupancy checks only.
    ///
    /// dtype/capacity/property compatibility is the caller's contract
    /// (`Filter::connect_sink` performs it against the filter's declared
    /// requirements).
    pub fn bind_sink(&mut self, port: usize, ring: Arc<BatchRing>) -> Result<()> {
        if port >= self.sinks.len() {
            return Err(SluiceError::InvalidSinkIdx {
                index: port,
                max: self.sinks.len(),
            });
        }
        if self.is_running() {
            return Err(SluiceError::state(format!(
                "filter `{}` cannot connect sinks while running",
                self.name
            )));
        }
        if self.sinks[port].is_some() {
            return Err(SluiceError::ConnectionOccupied { port });
        }
        debug!(filter = %self.name, port, ring = %ring.name(), "sink connected");
        self.sinks[port] = Some(ring);
        Ok(())
    }

    /// Clear the sink binding at `port`
    pub fn unbind_sink(&mut self, port: usize) -> Result<()> {
        match self.sinks.get_mut(port) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.output_props[port] = PropertyTable::new();
                debug!(filter = %self.name, port, "sink disconnected");
                Ok(())
            }
            _ => Err(SluiceError::InvalidSinkIdx {
                index: port,
                max: self.sinks.len(),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Spawn the worker thread; fails with `AlreadyRunning` on double start
    pub fn start_worker<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&WorkerContext) -> std::result::Result<(), WorkerError> + Send + 'static,
    {
        if self.is_running() {
            return Err(SluiceError::AlreadyRunning {
                filter: self.name.clone(),
            });
        }
        // Reap a finished worker from a previous run
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        self.stop.store(false, Ordering::Release);
        *self.worker_err.lock() = None;
        for ring in &self.inputs {
            ring.start();
        }

        let ctx = WorkerContext::new(
            self.name.clone(),
            self.inputs.clone(),
            self.sinks.clone(),
            Arc::clone(&self.stop),
            self.timeout,
            Arc::clone(&self.stats),
        );

        self.running.store(true, Ordering::Release);
        match worker::spawn_worker(
            format!("sluice-{}", self.name),
            Arc::clone(&self.running),
            Arc::clone(&self.worker_err),
            ctx,
            body,
        ) {
            Ok(handle) => {
                debug!(filter = %self.name, kind = %self.kind, "filter started");
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Request stop, wake all waiters on owned rings, join the worker.
    ///
    /// Idempotent: stopping a stopped filter succeeds.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        for ring in &self.inputs {
            ring.stop();
        }
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                let mut err = self.worker_err.lock();
                if err.is_none() {
                    *err = Some(worker_error!(
                        crate::error::ErrorCode::ThreadUnknown,
                        "worker thread for `{}` panicked",
                        self.name
                    ));
                }
            }
        }
        self.running.store(false, Ordering::Release);
        debug!(filter = %self.name, "filter stopped");
        Ok(())
    }

    /// Release rings and sink bindings; requires a stopped filter
    pub fn deinit(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(SluiceError::state(format!(
                "filter `{}` must be stopped before deinit",
                self.name
            )));
        }
        self.inputs.clear();
        self.input_props.clear();
        for slot in &mut self.sinks {
            *slot = None;
        }
        Ok(())
    }

    /// Human-readable diagnostic line
    pub fn describe(&self) -> String {
        let inputs: Vec<String> = self
            .inputs
            .iter()
            .map(|r| format!("{}({}/{})", r.name(), r.occupancy(), r.capacity()))
            .collect();
        let sinks: Vec<String> = self
            .sinks
            .iter()
            .enumerate()
            .map(|(port, sink)| match sink {
                Some(ring) => format!("{port}:{}", ring.name()),
                None => format!("{port}:-"),
            })
            .collect();
        format!(
            "{} [{}] running={} inputs=[{}] sinks=[{}]",
            self.name,
            self.kind,
            self.is_running(),
            inputs.join(", "),
            sinks.join(", ")
        )
    }
}

impl Drop for FilterCore {
    fn drop(&mut self) {
        // Backstop: never leak a running worker
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}
