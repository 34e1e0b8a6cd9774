//! Filter runtime: lifecycle, connections, worker threads
//!
//! A filter is a named pipeline stage with a dedicated worker thread, input
//! rings it owns, and sink rings it writes to. The [`Filter`] trait is the
//! uniform op table every stage implements; shared behaviour (sink
//! bookkeeping, stop/join, describe, stats) lives on [`FilterCore`] so
//! concrete filters contribute only their worker body and connection
//! requirements.
//!
//! Stages are wired with [`connect`], which binds an upstream sink port to a
//! downstream input ring and validates dtype, batch capacity, and declared
//! properties at that moment.

pub mod core;
pub mod passthrough;
pub mod stats;
pub mod worker;

pub use self::core::FilterCore;
pub use self::passthrough::{Passthrough, PassthroughConfig};
pub use self::stats::{FilterStats, StatsSnapshot};
pub use self::worker::{SlotState, WorkerContext, WorkerError};

use std::sync::Arc;

use crate::batch::SampleType;
use crate::error::{Result, SluiceError};
use crate::properties::{
    self, PropertyConstraint, PropertyId, PropertyTable, PropertyValue,
};
use crate::ring::BatchRing;

/// Role tag for a filter stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FilterKind {
    /// Produces batches from outside the graph
    Source,
    /// Transforms samples one batch at a time
    Map,
    /// Terminal consumer
    Sink,
    /// 1→N broadcast
    Tee,
    /// Matched-size 1→1 forwarder
    Passthrough,
    /// Batch-size realignment
    Matcher,
    /// Composite sub-graph exposed as one filter
    Pipeline,
}

impl std::fmt::Display for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::Map => "map",
            Self::Sink => "sink",
            Self::Tee => "tee",
            Self::Passthrough => "passthrough",
            Self::Matcher => "matcher",
            Self::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

/// What a filter requires of a ring bound to one of its sink ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkRequirements {
    /// Element type the port emits
    pub dtype: SampleType,
    /// Smallest acceptable batch capacity
    pub min_batch_capacity: usize,
    /// Largest acceptable batch capacity
    pub max_batch_capacity: usize,
}

impl SinkRequirements {
    /// Require an exact dtype and batch capacity
    pub fn exact(dtype: SampleType, batch_capacity: usize) -> Self {
        Self {
            dtype,
            min_batch_capacity: batch_capacity,
            max_batch_capacity: batch_capacity,
        }
    }

    /// Require a dtype and accept any batch capacity
    pub fn any_capacity(dtype: SampleType) -> Self {
        Self {
            dtype,
            min_batch_capacity: 1,
            max_batch_capacity: usize::MAX,
        }
    }
}

/// The uniform op table every filter implements
pub trait Filter: Send {
    /// Shared base state
    fn core(&self) -> &FilterCore;

    /// Shared base state, mutable
    fn core_mut(&mut self) -> &mut FilterCore;

    /// Spawn the worker; fails with `AlreadyRunning` on double start and
    /// `NoSink` when mandatory sinks are unbound
    fn start(&mut self) -> Result<()>;

    /// Request stop, wake waiters, join the worker; idempotent
    fn stop(&mut self) -> Result<()> {
        self.core_mut().stop()
    }

    /// Release rings and buffers; requires a stopped filter
    fn deinit(&mut self) -> Result<()> {
        self.core_mut().deinit()
    }

    /// Ring constraints for sink `port`
    fn sink_requirements(&self, port: usize) -> Result<SinkRequirements>;

    /// Declared requirements on input streams
    fn input_constraints(&self) -> Vec<PropertyConstraint> {
        Vec::new()
    }

    /// How output properties derive from input properties
    fn output_behaviours(&self) -> Vec<properties::PropertyBehaviour> {
        properties::preserve_all()
    }

    /// Everything this filter knows about its output stream at `port`:
    /// merged input knowledge folded through the declared behaviours, with
    /// explicitly recorded output knowledge taking precedence.
    fn output_properties(&self, port: usize) -> PropertyTable {
        let merged = self.core().merged_input_properties();
        let mut table = properties::propagate(&merged, &self.output_behaviours());
        if let Some(explicit) = self.core().output_properties(port) {
            table.merge_from(explicit);
        }
        table
    }

    /// Bind `ring` to sink `port`, validating dtype and batch capacity
    /// against this filter's requirements
    fn connect_sink(&mut self, port: usize, ring: Arc<BatchRing>) -> Result<()> {
        let req = self.sink_requirements(port)?;
        if ring.dtype() != req.dtype {
            return Err(SluiceError::DtypeMismatch {
                expected: req.dtype,
                actual: ring.dtype(),
            });
        }
        let capacity = ring.batch_capacity();
        if capacity < req.min_batch_capacity || capacity > req.max_batch_capacity {
            return Err(SluiceError::type_mismatch(format!(
                "ring `{}` batch capacity {} outside [{}, {}]",
                ring.name(),
                capacity,
                req.min_batch_capacity,
                req.max_batch_capacity
            )));
        }
        self.core_mut().bind_sink(port, ring)?;
        Ok(())
    }

    /// Clear the binding at sink `port`
    fn disconnect_sink(&mut self, port: usize) -> Result<()> {
        self.core_mut().unbind_sink(port)
    }

    /// Owned input ring at `port` (overridden by composites that forward)
    fn input_ring(&self, port: usize) -> Result<Arc<BatchRing>> {
        self.core().input_ring(port)
    }

    /// Human-readable diagnostic
    fn describe(&self) -> String {
        self.core().describe()
    }

    /// Snapshot of the filter's counters
    fn get_stats(&self) -> StatsSnapshot {
        self.core().stats_snapshot()
    }

    /// The worker's recorded failure, if any
    fn worker_err(&self) -> Option<WorkerError> {
        self.core().worker_err()
    }

    /// True while the worker is alive
    fn is_running(&self) -> bool {
        self.core().is_running()
    }

    /// Filter name
    fn name(&self) -> String {
        self.core().name().to_string()
    }
}

/// Bind `from`'s sink port to `to`'s input ring with full validation.
///
/// The upstream's declared output properties are checked against the
/// downstream's input constraints, recorded on the downstream port, and any
/// cross-port alignment constraint that becomes decidable is decided now.
pub fn connect(
    from: &mut dyn Filter,
    from_port: usize,
    to: &mut dyn Filter,
    to_port: usize,
) -> Result<()> {
    let ring = to.input_ring(to_port)?;

    let mut table = from.output_properties(from_port);
    // The ring itself pins dtype and capacity for everything downstream
    table.merge_from(&PropertyTable::from_ring(&ring));
    table.set(PropertyId::Dtype, PropertyValue::Dtype(ring.dtype()));

    properties::validate(&table, &to.input_constraints(), to_port)?;

    from.connect_sink(from_port, ring)?;
    to.core_mut().set_input_properties(to_port, table);

    properties::validate_aligned(
        &to.core().input_property_tables(),
        &to.input_constraints(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingConfig;

    #[test]
    fn test_sink_requirements_windows() {
        let exact = SinkRequirements::exact(SampleType::F32, 64);
        assert_eq!(exact.min_batch_capacity, 64);
        assert_eq!(exact.max_batch_capacity, 64);

        let any = SinkRequirements::any_capacity(SampleType::U8);
        assert!(any.max_batch_capacity > 1 << 24);
    }

    #[test]
    fn test_connect_passthrough_chain() {
        let mut from = Passthrough::new(PassthroughConfig::new("a", SampleType::F32)).unwrap();
        let mut to = Passthrough::new(PassthroughConfig::new("b", SampleType::F32)).unwrap();

        connect(&mut from, 0, &mut to, 0).unwrap();
        assert_eq!(from.core().sinks_bound(), 1);
        assert_eq!(
            to.core().input_properties(0).unwrap().get(PropertyId::Dtype),
            Some(PropertyValue::Dtype(SampleType::F32))
        );
    }

    #[test]
    fn test_connect_rejects_dtype_mismatch() {
        let mut from = Passthrough::new(PassthroughConfig::new("a", SampleType::F32)).unwrap();
        let mut to = Passthrough::new(PassthroughConfig::new("b", SampleType::I16)).unwrap();

        assert!(matches!(
            connect(&mut from, 0, &mut to, 0),
            Err(SluiceError::DtypeMismatch { .. })
        ));
    }

    #[test]
    fn test_connect_sink_rejects_capacity_window() {
        let mut from = Passthrough::new(PassthroughConfig::new("a", SampleType::F32)).unwrap();
        let small = BatchRing::new(
            RingConfig::new("small", SampleType::F32)
                .with_batch_expo(3)
                .unwrap(),
        )
        .unwrap();
        assert!(matches!(
            from.connect_sink(0, small),
            Err(SluiceError::TypeMismatch { .. })
        ));
    }
}
