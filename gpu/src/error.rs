//! GPU error types.

use thiserror::Error;

use crate::types::QueueType;

/// Errors that can occur while recording, submitting or managing GPU work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// The driver rejected a submission. The command's resource state changes
    /// were rolled back; the device is still usable.
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    /// The GPU device was lost. Every later operation fails with this error.
    #[error("GPU device lost")]
    DeviceLost,
    /// Out of GPU memory.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The external allocator could not satisfy a request.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),
    /// The signal pool reached its configured capacity.
    #[error("signal pool exhausted ({capacity} signals in use)")]
    OutOfSignals {
        /// Configured pool capacity.
        capacity: usize,
    },
    /// The caller violated an API contract.
    #[error("misuse: {0}")]
    Misuse(String),
    /// `begin` was called again from the thread that already holds the
    /// recording slot.
    #[error("reentrant command recording on {queue:?} queue")]
    ReentrantRecording {
        /// Queue type requested by the nested call.
        queue: QueueType,
    },
    /// The requested layout or ownership transition cannot be expressed.
    #[error("unsupported transition: {0}")]
    UnsupportedTransition(String),
    /// A requested feature is not supported by the driver or format.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// An internal invariant was broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GpuError {
    /// Returns true if the error leaves the device unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

/// Result alias used across the crate.
pub type GpuResult<T> = Result<T, GpuError>;
