//! Errors surfaced by coordinated requests and batches.

use std::time::Duration;
use thiserror::Error;

/// Final failure of a coordinated request.
///
/// The caller's own error is carried unchanged so its classification still applies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError<E> {
    /// The operation failed on its last attempt.
    #[error("{0}")]
    Operation(E),

    /// The last attempt exceeded the per-attempt timeout.
    #[error("request timed out after {}ms", .after.as_millis())]
    TimedOut {
        /// Per-attempt timeout that elapsed.
        after: Duration,
    },

    /// The task driving the request stopped before publishing a result.
    #[error("request was aborted before it settled")]
    Aborted,
}

impl<E> RequestError<E> {
    /// Borrow the caller's error, if the failure came from the operation itself.
    pub const fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::TimedOut { .. } | Self::Aborted => None,
        }
    }
}

/// Failure shared by every member of one batch window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError<E> {
    /// The batch executor failed.
    #[error("batch executor failed: {0}")]
    Executor(E),

    /// The executor returned a different number of results than it was given params.
    #[error("batch executor returned {actual} results for {expected} params")]
    LengthMismatch {
        /// Number of params flushed.
        expected: usize,
        /// Number of results returned.
        actual: usize,
    },

    /// The window was dropped before it flushed.
    #[error("batch window was dropped before it flushed")]
    Dropped,
}
