//! Error types and handling for the sluice runtime

use thiserror::Error;

use crate::batch::SampleType;

/// Result type alias for sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Stable error ordinals shared with batch sentinels and worker records.
///
/// The ordinals are part of the public contract: hosts may persist or
/// compare them across versions, and `Batch::ec` carries them in-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    /// Normal data / success
    Ok = 0,
    /// Blocking budget expired
    Timeout = 1,
    /// Ring or filter stop was requested
    Stopped = 2,
    /// Ring full under a non-blocking policy
    NoSpace = 3,
    /// Filter with outputs has no sink bound
    NoSink = 4,
    /// start() called on a running filter
    AlreadyRunning = 5,
    /// Invalid configuration parameter
    InvalidConfig = 6,
    /// Operation not valid in the current lifecycle state
    InvalidState = 7,
    /// Sink port index out of range
    InvalidSinkIdx = 8,
    /// Sink port already bound
    ConnectionOccupied = 9,
    /// Missing filter reference
    NullFilter = 10,
    /// Missing ring reference
    NullBuff = 11,
    /// Missing pointer argument
    NullPointer = 12,
    /// Connection endpoint types are incompatible
    TypeMismatch = 13,
    /// Sample element types differ
    DtypeMismatch = 14,
    /// Sample element widths differ
    WidthMismatch = 15,
    /// Declared properties violate a connection constraint
    PropertyMismatch = 16,
    /// Batch timestamp is not aligned to the sample period
    PhaseError = 17,
    /// Malformed in-band data
    InvalidData = 18,
    /// End-of-stream sentinel
    Complete = 19,
    /// Allocation failure
    Alloc = 20,
    /// Thread spawn/join failure
    ThreadUnknown = 21,
}

impl ErrorCode {
    /// Returns `true` for codes that terminate a stream without being a fault.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::Ok | Self::Complete)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Main error type for the sluice runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SluiceError {
    /// Blocking ring operation ran out of budget
    #[error("operation timed out")]
    Timeout,

    /// Ring stop was requested while waiting
    #[error("ring stopped")]
    Stopped,

    /// Ring is full under a non-blocking overflow policy
    #[error("no space in ring")]
    NoSpace,

    /// Filter with outputs was started or ran without a bound sink
    #[error("filter `{filter}` has no sink bound")]
    NoSink {
        /// Name of the filter missing a sink
        filter: String,
    },

    /// start() on an already-running filter
    #[error("filter `{filter}` is already running")]
    AlreadyRunning {
        /// Name of the running filter
        filter: String,
    },

    /// Invalid configuration parameter
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration issue
        message: String,
    },

    /// Operation not valid in the current lifecycle state
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the state violation
        message: String,
    },

    /// Sink port index out of range
    #[error("sink index {index} out of range (max {max})")]
    InvalidSinkIdx {
        /// Offending port index
        index: usize,
        /// Number of available ports
        max: usize,
    },

    /// Sink port already bound to a ring
    #[error("sink port {port} is already connected")]
    ConnectionOccupied {
        /// Occupied port index
        port: usize,
    },

    /// Missing filter reference
    #[error("null filter reference")]
    NullFilter,

    /// Missing ring reference
    #[error("null ring reference")]
    NullBuff,

    /// Missing pointer argument
    #[error("null pointer")]
    NullPointer,

    /// Connection endpoints are incompatible
    #[error("type mismatch: {message}")]
    TypeMismatch {
        /// Description of the incompatibility
        message: String,
    },

    /// Sample element types differ between connection endpoints
    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch {
        /// Element type the endpoint declared
        expected: SampleType,
        /// Element type actually offered
        actual: SampleType,
    },

    /// Sample widths differ between connection endpoints
    #[error("width mismatch: expected {expected} bytes, got {actual} bytes")]
    WidthMismatch {
        /// Expected element width in bytes
        expected: usize,
        /// Offered element width in bytes
        actual: usize,
    },

    /// Declared properties violate a connection constraint
    #[error("property mismatch: {message}")]
    PropertyMismatch {
        /// Description of the violated constraint
        message: String,
    },

    /// Batch timestamp is not an integer multiple of the sample period
    #[error("phase error: t_ns {t_ns} is not aligned to period {period_ns} ns")]
    PhaseError {
        /// Offending timestamp
        t_ns: u64,
        /// Stream sample period
        period_ns: u64,
    },

    /// Malformed in-band data
    #[error("invalid data: {message}")]
    InvalidData {
        /// Description of the data fault
        message: String,
    },

    /// End-of-stream sentinel observed
    #[error("stream complete")]
    Complete,

    /// Allocation failure
    #[error("allocation failed: {message}")]
    Alloc {
        /// Description of the allocation failure
        message: String,
    },

    /// Thread spawn or join failure
    #[error("thread error: {message}")]
    Thread {
        /// Description of the thread fault
        message: String,
    },
}

impl SluiceError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a new type-mismatch error
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Create a new property-mismatch error
    pub fn property_mismatch(message: impl Into<String>) -> Self {
        Self::PropertyMismatch {
            message: message.into(),
        }
    }

    /// Create a new data error
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a new thread error
    pub fn thread(message: impl Into<String>) -> Self {
        Self::Thread {
            message: message.into(),
        }
    }

    /// The stable ordinal for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout => ErrorCode::Timeout,
            Self::Stopped => ErrorCode::Stopped,
            Self::NoSpace => ErrorCode::NoSpace,
            Self::NoSink { .. } => ErrorCode::NoSink,
            Self::AlreadyRunning { .. } => ErrorCode::AlreadyRunning,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::InvalidSinkIdx { .. } => ErrorCode::InvalidSinkIdx,
            Self::ConnectionOccupied { .. } => ErrorCode::ConnectionOccupied,
            Self::NullFilter => ErrorCode::NullFilter,
            Self::NullBuff => ErrorCode::NullBuff,
            Self::NullPointer => ErrorCode::NullPointer,
            Self::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            Self::DtypeMismatch { .. } => ErrorCode::DtypeMismatch,
            Self::WidthMismatch { .. } => ErrorCode::WidthMismatch,
            Self::PropertyMismatch { .. } => ErrorCode::PropertyMismatch,
            Self::PhaseError { .. } => ErrorCode::PhaseError,
            Self::InvalidData { .. } => ErrorCode::InvalidData,
            Self::Complete => ErrorCode::Complete,
            Self::Alloc { .. } => ErrorCode::Alloc,
            Self::Thread { .. } => ErrorCode::ThreadUnknown,
        }
    }

    /// Check if the caller may retry after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::NoSpace)
    }

    /// Check if this error signals orderly shutdown rather than a fault
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Stopped | Self::Complete)
    }

    /// Check if this error is reported synchronously at configuration time
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::InvalidState { .. }
                | Self::InvalidSinkIdx { .. }
                | Self::ConnectionOccupied { .. }
                | Self::NullFilter
                | Self::NullBuff
                | Self::NullPointer
                | Self::TypeMismatch { .. }
                | Self::DtypeMismatch { .. }
                | Self::WidthMismatch { .. }
                | Self::PropertyMismatch { .. }
        )
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::SluiceError::config(format!($($arg)*))
    };
}

/// Convenience macro for creating property-mismatch errors
#[macro_export]
macro_rules! property_error {
    ($($arg:tt)*) => {
        $crate::error::SluiceError::property_mismatch(format!($($arg)*))
    };
}
