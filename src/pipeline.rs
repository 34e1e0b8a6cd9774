//! Pipeline - composite filter wrapping an internal sub-graph
//!
//! A pipeline owns an ordered list of internal filters and the connections
//! between them, expressed as `(from, from_port, to, to_port)` index tuples.
//! At construction it validates the topology (indices, single producer per
//! input, acyclicity via topological sort) and propagates declared stream
//! properties edge by edge from source-like nodes downward.
//!
//! Externally the composite behaves as one filter: the designated input
//! filter's ring is the pipeline's input 0, `connect_sink` forwards to the
//! designated output filter, `start` brings internal filters up in reverse
//! topological order (sinks first) and `stop` takes them down in forward
//! order. The first internal worker failure surfaces as the pipeline's own.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::constants::DEFAULT_OP_TIMEOUT;
use crate::error::{Result, SluiceError};
use crate::filter::{
    connect, Filter, FilterCore, FilterKind, SinkRequirements, StatsSnapshot, WorkerError,
};
use crate::properties::{self, PropertyTable};
use crate::property_error;
use crate::ring::BatchRing;

/// One internal edge: `from`'s sink port feeds `to`'s input port
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PipelineConnection {
    /// Index of the producing filter
    pub from: usize,
    /// Sink port on the producing filter
    pub from_port: usize,
    /// Index of the consuming filter
    pub to: usize,
    /// Input port on the consuming filter
    pub to_port: usize,
}

/// Designated external endpoint: an internal filter index plus port
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PipelineEndpoint {
    /// Internal filter index
    pub filter: usize,
    /// Port on that filter
    pub port: usize,
}

/// Configuration for a [`Pipeline`] filter
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,
    /// Internal edges
    pub connections: Vec<PipelineConnection>,
    /// Filter/port exposed as the pipeline's external input 0
    pub input: Option<PipelineEndpoint>,
    /// Filter/port exposed as the pipeline's external output 0
    pub output: Option<PipelineEndpoint>,
    /// Blocking budget recorded on the composite
    pub timeout: Duration,
}

impl PipelineConfig {
    /// Empty pipeline configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connections: Vec::new(),
            input: None,
            output: None,
            timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Add an internal connection
    pub fn with_connection(
        mut self,
        from: usize,
        from_port: usize,
        to: usize,
        to_port: usize,
    ) -> Self {
        self.connections.push(PipelineConnection {
            from,
            from_port,
            to,
            to_port,
        });
        self
    }

    /// Designate the external input endpoint
    pub fn with_input(mut self, filter: usize, port: usize) -> Self {
        self.input = Some(PipelineEndpoint { filter, port });
        self
    }

    /// Designate the external output endpoint
    pub fn with_output(mut self, filter: usize, port: usize) -> Self {
        self.output = Some(PipelineEndpoint { filter, port });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Init,
    Running,
    Stopped,
}

/// Composite filter wrapping an internal DAG of filters
pub struct Pipeline {
    core: FilterCore,
    config: PipelineConfig,
    filters: Vec<Box<dyn Filter>>,
    /// Node indices in execution (topological) order
    topo_order: Vec<usize>,
    state: PipelineState,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("filter_count", &self.filters.len())
            .field("topo_order", &self.topo_order)
            .field("state", &self.state)
            .finish()
    }
}

impl Pipeline {
    /// Validate the topology, wire internal connections, and propagate
    /// properties. Rejects cycles and malformed references with
    /// `InvalidConfig`.
    pub fn new(config: PipelineConfig, mut filters: Vec<Box<dyn Filter>>) -> Result<Self> {
        if filters.is_empty() {
            return Err(SluiceError::config("pipeline needs at least one filter"));
        }
        let n = filters.len();

        for conn in &config.connections {
            if conn.from >= n || conn.to >= n {
                return Err(SluiceError::config(format!(
                    "connection references filter index {} outside 0..{n}",
                    conn.from.max(conn.to)
                )));
            }
            if conn.from == conn.to {
                return Err(SluiceError::config(format!(
                    "connection graph contains a cycle: filter {} feeds itself",
                    conn.from
                )));
            }
        }
        for endpoint in [config.input, config.output].into_iter().flatten() {
            if endpoint.filter >= n {
                return Err(SluiceError::config(format!(
                    "endpoint references filter index {} outside 0..{n}",
                    endpoint.filter
                )));
            }
        }

        // Exactly one producer per input ring, one ring per sink port
        for (i, a) in config.connections.iter().enumerate() {
            for b in &config.connections[i + 1..] {
                if a.to == b.to && a.to_port == b.to_port {
                    return Err(SluiceError::config(format!(
                        "input port {} of filter {} has two producers",
                        a.to_port, a.to
                    )));
                }
                if a.from == b.from && a.from_port == b.from_port {
                    return Err(SluiceError::config(format!(
                        "sink port {} of filter {} is connected twice",
                        a.from_port, a.from
                    )));
                }
            }
        }

        let topo_order = topo_sort(n, &config.connections)?;

        // Wire edges in execution order of their source so property knowledge
        // flows downstream as each connection is validated
        for &node in &topo_order {
            for conn in config.connections.iter().filter(|c| c.from == node) {
                let (from, to) = pair_mut(&mut filters, conn.from, conn.to);
                connect(from, conn.from_port, to, conn.to_port).map_err(|err| {
                    property_context(conn, err)
                })?;
            }
        }

        let core = FilterCore::new(
            config.name.clone(),
            FilterKind::Pipeline,
            Vec::new(),
            1,
            config.timeout,
        )?;

        debug!(
            pipeline = %config.name,
            filters = n,
            connections = config.connections.len(),
            "pipeline topology validated"
        );

        Ok(Self {
            core,
            config,
            filters,
            topo_order,
            state: PipelineState::Init,
        })
    }

    /// Declare the property table arriving on the external input when no
    /// upstream filter exists, then re-propagate through the graph.
    pub fn add_input_properties(&mut self, table: PropertyTable) -> Result<()> {
        let endpoint = self.config.input.ok_or_else(|| {
            SluiceError::state("pipeline has no designated input endpoint")
        })?;
        self.filters[endpoint.filter]
            .core_mut()
            .set_input_properties(endpoint.port, table);
        self.repropagate()
    }

    /// Internal filter by index, for diagnostics and tests
    pub fn internal(&self, index: usize) -> Option<&dyn Filter> {
        self.filters.get(index).map(|f| f.as_ref())
    }

    /// Number of internal filters
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True when the pipeline wraps no filters (never constructed that way)
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Re-run property propagation over every internal edge
    fn repropagate(&mut self) -> Result<()> {
        for &node in &self.topo_order {
            let out_edges: Vec<PipelineConnection> = self
                .config
                .connections
                .iter()
                .copied()
                .filter(|c| c.from == node)
                .collect();
            for conn in out_edges {
                let table = {
                    let mut table = self.filters[conn.from].output_properties(conn.from_port);
                    let ring = self.filters[conn.to].input_ring(conn.to_port)?;
                    table.merge_from(&PropertyTable::from_ring(&ring));
                    table
                };
                properties::validate(
                    &table,
                    &self.filters[conn.to].input_constraints(),
                    conn.to_port,
                )
                .map_err(|err| property_context(&conn, err))?;
                self.filters[conn.to]
                    .core_mut()
                    .set_input_properties(conn.to_port, table);
            }
        }
        for filter in &self.filters {
            properties::validate_aligned(
                &filter.core().input_property_tables(),
                &filter.input_constraints(),
            )?;
        }
        Ok(())
    }
}

impl Filter for Pipeline {
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
        let endpoint = self
            .config
            .output
            .ok_or_else(|| SluiceError::state("pipeline has no designated output endpoint"))?;
        self.filters[endpoint.filter].sink_requirements(endpoint.port)
    }

    fn connect_sink(&mut self, port: usize, ring: Arc<BatchRing>) -> Result<()> {
        if port != 0 {
            return Err(SluiceError::InvalidSinkIdx { index: port, max: 1 });
        }
        let endpoint = self
            .config
            .output
            .ok_or_else(|| SluiceError::state("pipeline has no designated output endpoint"))?;
        self.filters[endpoint.filter].connect_sink(endpoint.port, ring)
    }

    fn disconnect_sink(&mut self, port: usize) -> Result<()> {
        if port != 0 {
            return Err(SluiceError::InvalidSinkIdx { index: port, max: 1 });
        }
        let endpoint = self
            .config
            .output
            .ok_or_else(|| SluiceError::state("pipeline has no designated output endpoint"))?;
        self.filters[endpoint.filter].disconnect_sink(endpoint.port)
    }

    fn input_ring(&self, port: usize) -> Result<Arc<BatchRing>> {
        if port != 0 {
            return Err(SluiceError::InvalidSinkIdx { index: port, max: 1 });
        }
        let endpoint = self
            .config
            .input
            .ok_or_else(|| SluiceError::state("pipeline has no designated input endpoint"))?;
        self.filters[endpoint.filter].input_ring(endpoint.port)
    }

    fn input_constraints(&self) -> Vec<properties::PropertyConstraint> {
        match self.config.input {
            Some(endpoint) => self.filters[endpoint.filter].input_constraints(),
            None => Vec::new(),
        }
    }

    fn output_properties(&self, _port: usize) -> PropertyTable {
        match self.config.output {
            Some(endpoint) => self.filters[endpoint.filter].output_properties(endpoint.port),
            None => PropertyTable::new(),
        }
    }

    /// Start internal filters in reverse topological order (sinks first) so
    /// no producer can block on an unstarted consumer
    fn start(&mut self) -> Result<()> {
        if self.state == PipelineState::Running {
            return Err(SluiceError::AlreadyRunning {
                filter: self.core.name().to_string(),
            });
        }
        let order: Vec<usize> = self.topo_order.iter().rev().copied().collect();
        for (started, &index) in order.iter().enumerate() {
            if let Err(err) = self.filters[index].start() {
                // Unwind the partial start
                for &stop_index in order[..started].iter() {
                    let _ = self.filters[stop_index].stop();
                }
                return Err(err);
            }
        }
        self.state = PipelineState::Running;
        debug!(pipeline = %self.core.name(), "pipeline started");
        Ok(())
    }

    /// Stop internal filters in forward topological order, then join all
    fn stop(&mut self) -> Result<()> {
        for &index in &self.topo_order {
            self.filters[index].stop()?;
        }
        self.state = PipelineState::Stopped;
        debug!(pipeline = %self.core.name(), "pipeline stopped");
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(SluiceError::state(format!(
                "pipeline `{}` must be stopped before deinit",
                self.core.name()
            )));
        }
        for filter in &mut self.filters {
            filter.deinit()?;
        }
        self.state = PipelineState::Init;
        self.core.deinit()
    }

    fn is_running(&self) -> bool {
        self.state == PipelineState::Running && self.filters.iter().any(|f| f.is_running())
    }

    /// First internal worker failure in execution order
    fn worker_err(&self) -> Option<WorkerError> {
        self.topo_order
            .iter()
            .find_map(|&index| self.filters[index].worker_err())
    }

    /// External view: consumption at the input endpoint, production at the
    /// output endpoint, timeouts summed across the graph
    fn get_stats(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        if let Some(input) = self.config.input {
            let inner = self.filters[input.filter].get_stats();
            snapshot.batches_in = inner.batches_in;
            snapshot.samples_in = inner.samples_in;
        }
        if let Some(output) = self.config.output {
            let inner = self.filters[output.filter].get_stats();
            snapshot.batches_out = inner.batches_out;
            snapshot.samples_out = inner.samples_out;
            snapshot.last_t_ns = inner.last_t_ns;
            snapshot.dropped_batches = inner.dropped_batches;
        }
        snapshot.timeouts = self.filters.iter().map(|f| f.get_stats().timeouts).sum();
        snapshot
    }

    fn describe(&self) -> String {
        let mut lines = vec![format!(
            "{} [pipeline] state={:?} filters={}",
            self.core.name(),
            self.state,
            self.filters.len()
        )];
        for &index in &self.topo_order {
            lines.push(format!("  {index}: {}", self.filters[index].describe()));
        }
        lines.join("\n")
    }
}

/// Kahn's algorithm over filter indices; deterministic by index order
fn topo_sort(n: usize, connections: &[PipelineConnection]) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; n];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for conn in connections {
        adjacency[conn.from].push(conn.to);
        indegree[conn.to] += 1;
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop() {
        order.push(node);
        for &next in &adjacency[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
    }

    if order.len() != n {
        return Err(SluiceError::config(
            "connection graph contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

/// Disjoint mutable borrows of two filters; `a != b` is the caller's contract
fn pair_mut(
    filters: &mut [Box<dyn Filter>],
    a: usize,
    b: usize,
) -> (&mut dyn Filter, &mut dyn Filter) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = filters.split_at_mut(b);
        (left[a].as_mut(), right[0].as_mut())
    } else {
        let (left, right) = filters.split_at_mut(a);
        (right[0].as_mut(), left[b].as_mut())
    }
}

fn property_context(conn: &PipelineConnection, err: SluiceError) -> SluiceError {
    match err {
        SluiceError::PropertyMismatch { message } => property_error!(
            "connection {}:{} -> {}:{}: {message}",
            conn.from,
            conn.from_port,
            conn.to,
            conn.to_port
        ),
        other => other,
    }
}
