//! sluice - streaming signal-processing pipeline runtime
//!
//! Pipelines of concurrently executing filters exchange fixed-capacity,
//! timestamped sample batches through bounded SPSC ring buffers. Each filter
//! runs one worker thread; rings provide blocking, timeout, and drop
//! semantics plus a cooperative stop signal, so whole graphs shut down
//! without thread kills.
//!
//! ## Building blocks
//!
//! - [`Batch`] / [`BatchRing`]: the unit of transfer and the bounded queue
//!   carrying it between exactly one producer and one consumer
//! - [`Filter`] / [`FilterCore`]: the uniform lifecycle (init → start → run →
//!   stop → deinit), connection table, and structured failure channel
//! - [`BatchMatcher`]: realigns variable-sized input batches onto a fixed
//!   output cadence with phase validation
//! - [`Tee`]: 1→N fan-out with per-output overflow policy
//! - [`Pipeline`]: a sub-graph of filters exposed as one filter
//!
//! ## Example
//!
//! ```no_run
//! use sluice::{connect, Passthrough, PassthroughConfig, SampleType};
//!
//! # fn main() -> sluice::Result<()> {
//! let mut head = Passthrough::new(PassthroughConfig::new("head", SampleType::F32))?;
//! let mut tail = Passthrough::new(PassthroughConfig::new("tail", SampleType::F32))?;
//! connect(&mut head, 0, &mut tail, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod clock;
pub mod constants;
pub mod error;
pub mod filter;
pub mod matcher;
pub mod pipeline;
pub mod properties;
pub mod ring;
pub mod tee;

// Re-export main components
pub use batch::{Batch, BatchMeta, Sample, SampleType};
pub use error::{ErrorCode, Result, SluiceError};
pub use filter::{
    connect, Filter, FilterCore, FilterKind, FilterStats, Passthrough, PassthroughConfig,
    SinkRequirements, SlotState, StatsSnapshot, WorkerContext, WorkerError,
};
pub use matcher::{BatchMatcher, MatcherConfig};
pub use pipeline::{Pipeline, PipelineConfig, PipelineConnection, PipelineEndpoint};
pub use properties::{
    BehaviourOp, ConstraintOp, PortMask, PropertyBehaviour, PropertyConstraint, PropertyId,
    PropertyTable, PropertyValue,
};
pub use ring::{BatchRing, ConsumeGuard, OverflowPolicy, ProduceGuard, RingConfig};
pub use tee::{Tee, TeeConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
