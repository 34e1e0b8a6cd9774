//! Bounded SPSC batch ring buffers
//!
//! A [`BatchRing`] is a fixed-size FIFO of preallocated [`Batch`](crate::batch::Batch)
//! slots between exactly one producer and one consumer. Producers reserve the
//! next write slot with [`BatchRing::get_head`], fill it in place, and publish
//! with [`ProduceGuard::submit`]; consumers borrow the oldest unread slot with
//! [`BatchRing::get_tail`] and retire it with [`ConsumeGuard::release`].
//!
//! Blocking, timeout, and overflow behaviour are governed by the ring's
//! [`OverflowPolicy`] and a cooperative stop signal that unblocks all waiters.

pub mod batch_ring;

pub use batch_ring::{BatchRing, ConsumeGuard, ProduceGuard};

use crate::batch::SampleType;
use crate::constants::{
    DEFAULT_BATCH_EXPO, DEFAULT_RING_EXPO, MAX_BATCH_EXPO, MAX_RING_EXPO, MIN_RING_EXPO,
};
use crate::error::{Result, SluiceError};

/// Rule a ring applies when the producer finds it full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum OverflowPolicy {
    /// Producer waits for capacity until timeout or stop
    #[default]
    Block,
    /// Producer is rejected immediately; the incoming batch is dropped
    DropHead,
    /// The oldest unread batch is evicted to make room
    DropTail,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Block => "block",
            Self::DropHead => "drop-head",
            Self::DropTail => "drop-tail",
        };
        f.write_str(name)
    }
}

/// Configuration for a batch ring
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RingConfig {
    /// Diagnostic name, surfaced in errors and describe() output
    pub name: String,
    /// Element type of every batch in the ring
    pub dtype: SampleType,
    /// Batch capacity is `2^batch_expo` samples
    pub batch_expo: u32,
    /// Ring depth is `2^ring_expo` slots
    pub ring_expo: u32,
    /// Behaviour when the ring is full
    pub overflow_policy: OverflowPolicy,
}

impl RingConfig {
    /// Create a configuration with default sizing and blocking overflow
    pub fn new(name: impl Into<String>, dtype: SampleType) -> Self {
        Self {
            name: name.into(),
            dtype,
            batch_expo: DEFAULT_BATCH_EXPO,
            ring_expo: DEFAULT_RING_EXPO,
            overflow_policy: OverflowPolicy::Block,
        }
    }

    /// Set the batch capacity exponent
    pub fn with_batch_expo(mut self, batch_expo: u32) -> Result<Self> {
        if batch_expo > MAX_BATCH_EXPO {
            return Err(SluiceError::config(format!(
                "batch_expo {batch_expo} above limit {MAX_BATCH_EXPO}"
            )));
        }
        self.batch_expo = batch_expo;
        Ok(self)
    }

    /// Set the ring depth exponent
    pub fn with_ring_expo(mut self, ring_expo: u32) -> Result<Self> {
        if !(MIN_RING_EXPO..=MAX_RING_EXPO).contains(&ring_expo) {
            return Err(SluiceError::config(format!(
                "ring_expo {ring_expo} outside [{MIN_RING_EXPO}, {MAX_RING_EXPO}]"
            )));
        }
        self.ring_expo = ring_expo;
        Ok(self)
    }

    /// Set the overflow policy
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Number of slots in the ring
    #[inline]
    pub fn ring_capacity(&self) -> usize {
        1usize << self.ring_expo
    }

    /// Number of samples per batch
    #[inline]
    pub fn batch_capacity(&self) -> usize {
        1usize << self.batch_expo
    }

    /// Check all bounds; `BatchRing::new` calls this before allocating
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SluiceError::config("ring name must not be empty"));
        }
        if !(MIN_RING_EXPO..=MAX_RING_EXPO).contains(&self.ring_expo) {
            return Err(SluiceError::config(format!(
                "ring_expo {} outside [{MIN_RING_EXPO}, {MAX_RING_EXPO}]",
                self.ring_expo
            )));
        }
        if self.batch_expo > MAX_BATCH_EXPO {
            return Err(SluiceError::config(format!(
                "batch_expo {} above limit {MAX_BATCH_EXPO}",
                self.batch_expo
            )));
        }
        Ok(())
    }
}
