//! Timestamped sample batch — the unit of transfer between filters
//!
//! A [`Batch`] is a fixed-capacity run of same-typed samples plus timing
//! metadata. Batches live inside preallocated ring slots; producers fill the
//! valid window `data[0..head]` and consumers read it back. Raw storage is
//! 8-byte aligned so every supported element type can be viewed in place.

use std::any::Any;
use std::sync::Arc;

use crate::error::{ErrorCode, Result, SluiceError};

/// Sample element types carried by batches and rings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SampleType {
    /// Signed 8-bit integer
    I8,
    /// Signed 16-bit integer
    I16,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Unsigned 64-bit integer
    U64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl SampleType {
    /// Element width in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

impl std::fmt::Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Primitive types usable as batch samples.
///
/// Sealed: exactly the ten widths the wire model supports.
pub trait Sample: bytemuck::Pod + Send + Sync + sealed::Sealed + 'static {
    /// The runtime tag for this element type
    const DTYPE: SampleType;
}

macro_rules! impl_sample {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Sample for $ty {
                const DTYPE: SampleType = SampleType::$dtype;
            }
        )*
    };
}

impl_sample!(
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
);

static_assertions::assert_impl_all!(f64: Sample);
static_assertions::assert_impl_all!(u8: Sample);

/// Opaque producer-owned metadata forwarded with a batch
pub type BatchMeta = Arc<dyn Any + Send + Sync>;

/// Fixed-capacity typed sample buffer with timing metadata
pub struct Batch {
    /// Raw storage, 8-byte aligned; logical length is `capacity * dtype.size_bytes()`
    data: Box<[u64]>,
    dtype: SampleType,
    capacity: usize,
    /// Count of valid samples; the valid window is `data[0..head]`
    pub head: usize,
    /// Timestamp of sample 0 in nanoseconds
    pub t_ns: u64,
    /// Inter-sample period in nanoseconds; 0 denotes irregular timing
    pub period_ns: u64,
    /// Monotonic identifier assigned by the producing filter
    pub batch_id: u64,
    /// Terminal code: `Ok` for data, `Complete` for end-of-stream, else upstream failure
    pub ec: ErrorCode,
    /// Opaque pass-through metadata (shared, never inspected by the core)
    pub meta: Option<BatchMeta>,
}

impl Batch {
    /// Allocate a batch holding up to `capacity` samples of `dtype`
    pub fn new(dtype: SampleType, capacity: usize) -> Self {
        let byte_len = capacity * dtype.size_bytes();
        let words = byte_len.div_ceil(8);
        Self {
            data: vec![0u64; words].into_boxed_slice(),
            dtype,
            capacity,
            head: 0,
            t_ns: 0,
            period_ns: 0,
            batch_id: 0,
            ec: ErrorCode::Ok,
            meta: None,
        }
    }

    /// Element type of this batch
    #[inline]
    pub fn dtype(&self) -> SampleType {
        self.dtype
    }

    /// Maximum number of samples this batch can hold
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when no valid samples are present
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    /// Raw bytes of the full sample area (capacity window)
    #[inline]
    pub fn raw_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.data[..])[..self.capacity * self.dtype.size_bytes()]
    }

    /// Mutable raw bytes of the full sample area
    #[inline]
    pub fn raw_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.capacity * self.dtype.size_bytes();
        &mut bytemuck::cast_slice_mut(&mut self.data[..])[..len]
    }

    /// Raw bytes of the valid window `[0, head)`
    #[inline]
    pub fn valid_bytes(&self) -> &[u8] {
        &self.raw_bytes()[..self.head * self.dtype.size_bytes()]
    }

    /// Typed view of the valid window
    pub fn samples<T: Sample>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        Ok(bytemuck::cast_slice(self.valid_bytes()))
    }

    /// Typed mutable view of the full capacity window.
    ///
    /// Producers write here, then record the valid count with [`set_head`].
    ///
    /// [`set_head`]: Batch::set_head
    pub fn samples_mut<T: Sample>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        let bytes = self.raw_bytes_mut();
        Ok(bytemuck::cast_slice_mut(bytes))
    }

    /// Record the number of valid samples
    pub fn set_head(&mut self, head: usize) -> Result<()> {
        if head > self.capacity {
            return Err(SluiceError::invalid_data(format!(
                "head {head} exceeds batch capacity {}",
                self.capacity
            )));
        }
        self.head = head;
        Ok(())
    }

    /// Copy the valid window and all metadata from another batch.
    ///
    /// Both batches must share dtype and the source window must fit.
    pub fn copy_from(&mut self, src: &Batch) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(SluiceError::DtypeMismatch {
                expected: self.dtype,
                actual: src.dtype,
            });
        }
        if src.head > self.capacity {
            return Err(SluiceError::NoSpace);
        }
        let byte_len = src.head * src.dtype.size_bytes();
        self.raw_bytes_mut()[..byte_len].copy_from_slice(&src.valid_bytes()[..byte_len]);
        self.head = src.head;
        self.t_ns = src.t_ns;
        self.period_ns = src.period_ns;
        self.batch_id = src.batch_id;
        self.ec = src.ec;
        self.meta = src.meta.clone();
        Ok(())
    }

    /// Reset metadata for slot reuse; storage is retained
    pub fn reset(&mut self) {
        self.head = 0;
        self.t_ns = 0;
        self.period_ns = 0;
        self.batch_id = 0;
        self.ec = ErrorCode::Ok;
        self.meta = None;
    }

    /// Turn this batch into an end-of-stream sentinel
    pub fn mark_complete(&mut self) {
        self.head = 0;
        self.ec = ErrorCode::Complete;
        self.meta = None;
    }

    /// True when this batch is the end-of-stream sentinel
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.ec == ErrorCode::Complete
    }

    fn check_dtype<T: Sample>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(SluiceError::DtypeMismatch {
                expected: self.dtype,
                actual: T::DTYPE,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("dtype", &self.dtype)
            .field("capacity", &self.capacity)
            .field("head", &self.head)
            .field("t_ns", &self.t_ns)
            .field("period_ns", &self.period_ns)
            .field("batch_id", &self.batch_id)
            .field("ec", &self.ec)
            .finish_non_exhaustive()
    }
}
