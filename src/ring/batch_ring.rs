//! BatchRing - bounded SPSC ring of preallocated batch slots
//!
//! All cursor state lives under one mutex with two condition variables
//! (`not_empty`, `not_full`). Slot contents are filled and read outside the
//! lock through reservation guards, so a producer writing a large batch never
//! stalls the consumer's cursor operations.
//!
//! ## Synchronization protocol
//!
//! - `head_idx` / `tail_idx` are monotonic u64 cursors; occupancy is their
//!   difference and the slot index is `cursor & mask`.
//! - At most one outstanding [`ProduceGuard`] and one [`ConsumeGuard`] exist
//!   at any time (`head_reserved` / `tail_held` flags, checked under the lock).
//! - The producer-side guard points at the unpublished slot `head_idx`; the
//!   consumer-side guard points at `tail_idx`, which eviction never touches
//!   while held. Slot access outside the lock is race-free by this protocol.
//! - `stop()` sets `stop_requested` and broadcasts both condvars; every
//!   blocked or subsequent ring operation observes it and returns `Stopped`.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::batch::{Batch, SampleType};
use crate::error::{Result, SluiceError};
use crate::ring::{OverflowPolicy, RingConfig};

struct RingState {
    /// Producer cursor (next slot to publish)
    head_idx: u64,
    /// Consumer cursor (oldest unread slot)
    tail_idx: u64,
    /// A ProduceGuard is outstanding on slot `head_idx`
    head_reserved: bool,
    /// A ConsumeGuard is outstanding on slot `tail_idx`
    tail_held: bool,
    /// Highest occupancy observed since start
    high_watermark: u64,
}

/// Bounded SPSC ring of preallocated [`Batch`] slots
pub struct BatchRing {
    name: String,
    dtype: SampleType,
    batch_capacity: usize,
    capacity: usize,
    mask: u64,
    policy: OverflowPolicy,

    state: CachePadded<Mutex<RingState>>,
    not_empty: Condvar,
    not_full: Condvar,

    running: AtomicBool,
    stop_requested: AtomicBool,
    dropped: CachePadded<AtomicU64>,

    slots: Box<[UnsafeCell<Batch>]>,
}

// SAFETY: slot contents are only touched through ProduceGuard/ConsumeGuard,
// and the reservation flags under the mutex guarantee at most one writer on
// the unpublished head slot and one reader on the held tail slot. All cursor
// state is mutex-protected.
unsafe impl Send for BatchRing {}
unsafe impl Sync for BatchRing {}

impl BatchRing {
    /// Allocate a ring and every batch slot up front
    pub fn new(config: RingConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let capacity = config.ring_capacity();
        let batch_capacity = config.batch_capacity();
        let slots: Box<[UnsafeCell<Batch>]> = (0..capacity)
            .map(|_| UnsafeCell::new(Batch::new(config.dtype, batch_capacity)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Arc::new(Self {
            name: config.name,
            dtype: config.dtype,
            batch_capacity,
            capacity,
            mask: (capacity - 1) as u64,
            policy: config.overflow_policy,
            state: CachePadded::new(Mutex::new(RingState {
                head_idx: 0,
                tail_idx: 0,
                head_reserved: false,
                tail_held: false,
                high_watermark: 0,
            })),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            dropped: CachePadded::new(AtomicU64::new(0)),
            slots,
        }))
    }

    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Transition to running; must precede any blocking wait
    pub fn start(&self) {
        self.stop_requested.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    /// Request stop and wake every blocked producer and consumer; idempotent
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        // Waiters re-check stop_requested after wakeup
        let _guard = self.state.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// True between start() and stop()
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True once stop() has been requested
    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Reserve the next producer slot.
    ///
    /// When the ring is full the behaviour follows the overflow policy:
    /// `Block` waits up to `timeout` on the not-full signal, `DropHead`
    /// reports `NoSpace` immediately (the incoming batch is the one
    /// rejected), `DropTail` evicts the oldest unread batch and reuses its
    /// slot. A zero timeout polls.
    ///
    /// The returned guard gives `&mut Batch` access to the reserved slot;
    /// publish it with [`ProduceGuard::submit`] or drop the guard to abandon
    /// the reservation.
    pub fn get_head(&self, timeout: Duration) -> Result<ProduceGuard<'_>> {
        let mut st = self.state.lock();
        if st.head_reserved {
            return Err(SluiceError::state(format!(
                "ring `{}` already has an outstanding producer reservation",
                self.name
            )));
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return Err(SluiceError::Stopped);
            }
            if st.head_idx - st.tail_idx < self.capacity as u64 {
                break;
            }
            match self.policy {
                OverflowPolicy::Block => {
                    if !self.running.load(Ordering::Acquire) {
                        return Err(SluiceError::state(format!(
                            "ring `{}` not started",
                            self.name
                        )));
                    }
                    let Some(deadline) = deadline else {
                        return Err(SluiceError::Timeout);
                    };
                    if self.not_full.wait_until(&mut st, deadline).timed_out() {
                        return Err(SluiceError::Timeout);
                    }
                }
                OverflowPolicy::DropHead => return Err(SluiceError::NoSpace),
                OverflowPolicy::DropTail => {
                    if st.tail_held {
                        // Cannot evict a slot mid-read; reject this batch instead
                        return Err(SluiceError::NoSpace);
                    }
                    st.tail_idx += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(ring = %self.name, "evicted oldest batch under drop-tail");
                    break;
                }
            }
        }

        st.head_reserved = true;
        let idx = (st.head_idx & self.mask) as usize;
        drop(st);

        // SAFETY: head_reserved excludes any other producer guard and the
        // consumer never reads slot head_idx before it is published.
        let slot = self.slots[idx].get();
        unsafe {
            (*slot).reset();
        }
        Ok(ProduceGuard {
            ring: self,
            slot,
            done: false,
        })
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Borrow the oldest unread batch.
    ///
    /// Waits up to `timeout` on the not-empty signal when the ring is empty;
    /// a zero timeout polls. Retire the slot with [`ConsumeGuard::release`].
    pub fn get_tail(&self, timeout: Duration) -> Result<ConsumeGuard<'_>> {
        let mut st = self.state.lock();
        if st.tail_held {
            return Err(SluiceError::state(format!(
                "ring `{}` already has an outstanding consumer guard",
                self.name
            )));
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return Err(SluiceError::Stopped);
            }
            if st.head_idx > st.tail_idx {
                break;
            }
            if !self.running.load(Ordering::Acquire) {
                return Err(SluiceError::state(format!(
                    "ring `{}` not started",
                    self.name
                )));
            }
            let Some(deadline) = deadline else {
                return Err(SluiceError::Timeout);
            };
            if self.not_empty.wait_until(&mut st, deadline).timed_out() {
                return Err(SluiceError::Timeout);
            }
        }

        st.tail_held = true;
        let idx = (st.tail_idx & self.mask) as usize;
        drop(st);

        // SAFETY: tail_held prevents eviction and double-consume of this
        // slot; the producer only writes the unpublished head slot.
        let slot = self.slots[idx].get();
        Ok(ConsumeGuard {
            ring: self,
            slot,
            done: false,
        })
    }

    // ---------------------------------------------------------------------
    // QUERIES
    // ---------------------------------------------------------------------

    /// Number of submitted, unconsumed batches
    pub fn occupancy(&self) -> usize {
        let st = self.state.lock();
        (st.head_idx - st.tail_idx) as usize
    }

    /// True when every slot holds an unconsumed batch
    pub fn is_full(&self) -> bool {
        self.occupancy() == self.capacity
    }

    /// True when no unconsumed batch is queued
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    /// Highest occupancy observed since construction
    pub fn high_watermark(&self) -> usize {
        self.state.lock().high_watermark as usize
    }

    /// Batches evicted or rejected by a drop policy
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Diagnostic name
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element type of every batch in this ring
    #[inline]
    pub fn dtype(&self) -> SampleType {
        self.dtype
    }

    /// Samples per batch slot
    #[inline]
    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy
    #[inline]
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.policy
    }
}

impl std::fmt::Debug for BatchRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRing")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("capacity", &self.capacity)
            .field("batch_capacity", &self.batch_capacity)
            .field("policy", &self.policy)
            .field("occupancy", &self.occupancy())
            .finish()
    }
}

/// Reservation of the next producer slot; publish with [`submit`](Self::submit)
#[derive(Debug)]
pub struct ProduceGuard<'a> {
    ring: &'a BatchRing,
    slot: *mut Batch,
    done: bool,
}

impl ProduceGuard<'_> {
    /// Publish the reserved slot and signal the consumer.
    ///
    /// Fails with `Stopped` (without publishing) once stop was requested.
    pub fn submit(mut self) -> Result<()> {
        self.done = true;
        let mut st = self.ring.state.lock();
        st.head_reserved = false;
        if self.ring.stop_requested.load(Ordering::Acquire) {
            return Err(SluiceError::Stopped);
        }
        st.head_idx += 1;
        let occupancy = st.head_idx - st.tail_idx;
        if occupancy > st.high_watermark {
            st.high_watermark = occupancy;
        }
        drop(st);
        self.ring.not_empty.notify_one();
        Ok(())
    }
}

impl Deref for ProduceGuard<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        // SAFETY: exclusive reservation, see get_head
        unsafe { &*self.slot }
    }
}

impl DerefMut for ProduceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Batch {
        // SAFETY: exclusive reservation, see get_head
        unsafe { &mut *self.slot }
    }
}

impl Drop for ProduceGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.ring.state.lock().head_reserved = false;
        }
    }
}

/// Borrow of the oldest unread batch; retire with [`release`](Self::release)
#[derive(Debug)]
pub struct ConsumeGuard<'a> {
    ring: &'a BatchRing,
    slot: *const Batch,
    done: bool,
}

impl ConsumeGuard<'_> {
    /// Advance the consumer cursor past this batch and signal the producer
    pub fn release(mut self) {
        self.done = true;
        let mut st = self.ring.state.lock();
        st.tail_held = false;
        st.tail_idx += 1;
        drop(st);
        self.ring.not_full.notify_one();
    }
}

impl Deref for ConsumeGuard<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        // SAFETY: tail_held excludes eviction and reuse of this slot
        unsafe { &*self.slot }
    }
}

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            // Batch stays queued; a later get_tail sees it again
            self.ring.state.lock().tail_held = false;
        }
    }
}
