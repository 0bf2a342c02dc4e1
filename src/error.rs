//! Crate-wide error types.
//!
//! `GgufError` is the one broad, untrusted-input-facing error type, for
//! malformed file contents a caller can legitimately hit and should be able
//! to recover from. Everywhere else, shape/type mismatches between tensors
//! are a caller bug rather than a runtime condition, and are reported by
//! panicking instead of threading a `Result` through every factory call.

use thiserror::Error;

pub use crate::gguf::GgufError;

/// Status returned by [`crate::executor::compute`].
///
/// `FAILED` and `ALLOC_FAILED` are reserved for callers that wrap this
/// executor behind an allocating backend; this crate's own CPU path never
/// emits them itself (it aborts on arena exhaustion instead), but they are
/// part of the contract so a caller can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    /// The graph computed successfully.
    Success,
    /// Reserved: a calling backend reported failure.
    Failed,
    /// Reserved: a calling backend's allocation failed.
    AllocFailed,
    /// `abort_callback` requested cancellation.
    Aborted,
}

/// Errors returned from [`crate::plan::plan`].
#[derive(Debug, Error)]
pub enum PlanError {
    /// The caller-provided work buffer is smaller than `work_size`.
    #[error("work buffer too small: need {needed} bytes, got {have}")]
    WorkBufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes provided.
        have: usize,
    },
}
