//! Connection property tables and compatibility validation
//!
//! Filters publish what they know about their output streams and what they
//! require of their input streams. Both sides are expressed over the same
//! fixed-index [`PropertyTable`]; validation is a pure function over an
//! upstream table and a downstream constraint list, evaluated at connect
//! time and again during pipeline property propagation.

use crate::batch::SampleType;
use crate::error::{Result, SluiceError};
use crate::property_error;
use crate::ring::BatchRing;

/// Fixed property indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(usize)]
pub enum PropertyId {
    /// Sample element type
    Dtype = 0,
    /// Lower bound on batch capacity
    MinBatchCapacity = 1,
    /// Upper bound on batch capacity
    MaxBatchCapacity = 2,
    /// Inter-sample period in nanoseconds
    PeriodNs = 3,
    /// Stream carries regular timing (`period_ns > 0`)
    Regular = 4,
}

impl PropertyId {
    /// Number of property slots
    pub const COUNT: usize = 5;

    /// All property ids in index order
    pub const ALL: [PropertyId; Self::COUNT] = [
        PropertyId::Dtype,
        PropertyId::MinBatchCapacity,
        PropertyId::MaxBatchCapacity,
        PropertyId::PeriodNs,
        PropertyId::Regular,
    ];
}

impl std::fmt::Display for PropertyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Dtype => "dtype",
            Self::MinBatchCapacity => "min_batch_capacity",
            Self::MaxBatchCapacity => "max_batch_capacity",
            Self::PeriodNs => "period_ns",
            Self::Regular => "regular",
        };
        f.write_str(name)
    }
}

/// Value stored in a property slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PropertyValue {
    /// Element type
    Dtype(SampleType),
    /// Unsigned magnitude (capacities, periods)
    U64(u64),
    /// Boolean flag
    Bool(bool),
}

impl PropertyValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dtype(d) => write!(f, "{d}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Fixed-index map of known stream attributes; `None` means unknown
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyTable {
    slots: [Option<PropertyValue>; PropertyId::COUNT],
}

impl PropertyTable {
    /// Empty table: everything unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Table describing what a ring structurally guarantees
    pub fn from_ring(ring: &BatchRing) -> Self {
        let mut table = Self::new();
        table.set(PropertyId::Dtype, PropertyValue::Dtype(ring.dtype()));
        table.set(
            PropertyId::MinBatchCapacity,
            PropertyValue::U64(ring.batch_capacity() as u64),
        );
        table.set(
            PropertyId::MaxBatchCapacity,
            PropertyValue::U64(ring.batch_capacity() as u64),
        );
        table
    }

    /// Record a known value
    pub fn set(&mut self, id: PropertyId, value: PropertyValue) {
        self.slots[id as usize] = Some(value);
    }

    /// Forget a value
    pub fn clear(&mut self, id: PropertyId) {
        self.slots[id as usize] = None;
    }

    /// Look up a value; `None` when unknown
    pub fn get(&self, id: PropertyId) -> Option<PropertyValue> {
        self.slots[id as usize]
    }

    /// True when the value is known
    pub fn known(&self, id: PropertyId) -> bool {
        self.slots[id as usize].is_some()
    }

    /// Copy known values from `other`, overwriting on conflict
    pub fn merge_from(&mut self, other: &PropertyTable) {
        for id in PropertyId::ALL {
            if let Some(value) = other.get(id) {
                self.set(id, value);
            }
        }
    }
}

/// Comparison operators for input constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConstraintOp {
    /// The property must be known
    Exists,
    /// The property must equal the constraint value
    Eq,
    /// The property must be >= the constraint value (numeric)
    Gte,
    /// The property must be <= the constraint value (numeric)
    Lte,
    /// Every designated input port must carry the same value
    MultiInputAligned,
}

/// Bitmask selecting the input ports a constraint applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortMask(pub u64);

impl PortMask {
    /// Every port
    pub const ALL: PortMask = PortMask(u64::MAX);

    /// A single port
    pub fn port(port: usize) -> Self {
        Self(1u64 << port)
    }

    /// True when `port` is selected
    pub fn contains(&self, port: usize) -> bool {
        port < 64 && self.0 & (1u64 << port) != 0
    }
}

/// Declared requirement on an input stream
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyConstraint {
    /// Property under constraint
    pub property: PropertyId,
    /// Comparison applied
    pub op: ConstraintOp,
    /// Input ports the constraint covers
    pub ports: PortMask,
    /// Right-hand side; unused for `Exists` / `MultiInputAligned`
    pub value: Option<PropertyValue>,
}

impl PropertyConstraint {
    /// Constraint applying to every input port
    pub fn all_ports(property: PropertyId, op: ConstraintOp, value: Option<PropertyValue>) -> Self {
        Self {
            property,
            op,
            ports: PortMask::ALL,
            value,
        }
    }
}

/// How a filter derives an output property from its inputs
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BehaviourOp {
    /// Output carries the input value unchanged
    Preserve,
    /// Output forces the attached value regardless of input
    Set,
}

/// Declared output behaviour for one property
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyBehaviour {
    /// Property being described
    pub property: PropertyId,
    /// Derivation rule
    pub op: BehaviourOp,
    /// Value for `Set`; ignored for `Preserve`
    pub value: Option<PropertyValue>,
}

/// Check one upstream table against the constraints covering `port`.
///
/// A constraint on an unknown property fails only for `Exists`; unknown
/// values are otherwise undecidable at this edge and accepted (the worker
/// re-validates what it can at runtime, e.g. the matcher's phase check).
pub fn validate(
    upstream: &PropertyTable,
    constraints: &[PropertyConstraint],
    port: usize,
) -> Result<()> {
    for constraint in constraints {
        if !constraint.ports.contains(port) {
            continue;
        }
        let actual = upstream.get(constraint.property);
        match constraint.op {
            ConstraintOp::Exists => {
                if actual.is_none() {
                    return Err(property_error!(
                        "port {port} requires property `{}` to be known",
                        constraint.property
                    ));
                }
            }
            ConstraintOp::Eq => {
                if let (Some(actual), Some(expected)) = (actual, constraint.value) {
                    if actual != expected {
                        return Err(property_error!(
                            "port {port} property `{}`: expected {expected}, got {actual}",
                            constraint.property
                        ));
                    }
                }
            }
            ConstraintOp::Gte => {
                if let (Some(actual), Some(bound)) = (actual, constraint.value) {
                    match (actual.as_u64(), bound.as_u64()) {
                        (Some(a), Some(b)) if a < b => {
                            return Err(property_error!(
                                "port {port} property `{}`: {a} below required {b}",
                                constraint.property
                            ));
                        }
                        (Some(_), Some(_)) => {}
                        _ => {
                            return Err(property_error!(
                                "port {port} property `{}`: GTE needs numeric values",
                                constraint.property
                            ));
                        }
                    }
                }
            }
            ConstraintOp::Lte => {
                if let (Some(actual), Some(bound)) = (actual, constraint.value) {
                    match (actual.as_u64(), bound.as_u64()) {
                        (Some(a), Some(b)) if a > b => {
                            return Err(property_error!(
                                "port {port} property `{}`: {a} above allowed {b}",
                                constraint.property
                            ));
                        }
                        (Some(_), Some(_)) => {}
                        _ => {
                            return Err(property_error!(
                                "port {port} property `{}`: LTE needs numeric values",
                                constraint.property
                            ));
                        }
                    }
                }
            }
            // Needs visibility over all ports; checked by validate_aligned
            ConstraintOp::MultiInputAligned => {}
        }
    }
    Ok(())
}

/// Check `MultiInputAligned` constraints across every covered input table
pub fn validate_aligned(
    tables: &[&PropertyTable],
    constraints: &[PropertyConstraint],
) -> Result<()> {
    for constraint in constraints {
        if constraint.op != ConstraintOp::MultiInputAligned {
            continue;
        }
        let mut seen: Option<(usize, PropertyValue)> = None;
        for (port, table) in tables.iter().enumerate() {
            if !constraint.ports.contains(port) {
                continue;
            }
            let Some(value) = table.get(constraint.property) else {
                continue;
            };
            match seen {
                None => seen = Some((port, value)),
                Some((first_port, first)) if first != value => {
                    return Err(property_error!(
                        "property `{}` differs across inputs: port {first_port} has {first}, port {port} has {value}",
                        constraint.property
                    ));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Derive an output table from merged input knowledge and declared behaviours
pub fn propagate(inputs: &PropertyTable, behaviours: &[PropertyBehaviour]) -> PropertyTable {
    let mut out = PropertyTable::new();
    for behaviour in behaviours {
        match behaviour.op {
            BehaviourOp::Preserve => {
                if let Some(value) = inputs.get(behaviour.property) {
                    out.set(behaviour.property, value);
                }
            }
            BehaviourOp::Set => {
                if let Some(value) = behaviour.value {
                    out.set(behaviour.property, value);
                }
            }
        }
    }
    out
}

/// Behaviour list that forwards every property unchanged
pub fn preserve_all() -> Vec<PropertyBehaviour> {
    PropertyId::ALL
        .iter()
        .map(|&property| PropertyBehaviour {
            property,
            op: BehaviourOp::Preserve,
            value: None,
        })
        .collect()
}
