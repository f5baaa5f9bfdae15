//! Error taxonomy for the batch core.
//!
//! Each crate gets one concrete, `thiserror`-derived enum realizing the
//! abstract kinds in spec §7. `Categorizable::is_retryable` lets callers
//! (schedulers, workers, control surfaces) decide whether to back off and
//! retry or surface the failure verbatim, without matching on variants.

use crate::model::BatchId;

/// Whether an error kind should be retried by its caller.
pub trait Categorizable {
    fn is_retryable(&self) -> bool;
}

/// Errors from a [`crate::store::BatchStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BatchStoreError {
    #[error("batch {0} not found")]
    NotFound(BatchId),

    #[error("batch {0} already exists")]
    Conflict(BatchId),

    #[error("lease on batch {0} held by another holder")]
    LeaseConflict(BatchId),

    #[error("lease on batch {0} lost or held by a different holder")]
    LeaseLost(BatchId),

    #[error("invariant violated on batch {0}: {reason}")]
    InvariantViolation { batch: BatchId, reason: String },

    #[error("batch {0} is in a terminal state and cannot be mutated")]
    Terminal(BatchId),

    #[error("transient store error, retriable: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("permanent store error: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl Categorizable for BatchStoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::LeaseConflict(_))
    }
}

/// Errors surfaced by [`crate::submission::SubmissionApi`].
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] BatchStoreError),
}

/// Errors surfaced by [`crate::control::ControlApi`].
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("batch {0} not found")]
    NotFound(BatchId),

    #[error("batch {0} is in a terminal state")]
    Terminal(BatchId),

    #[error("batch {0} is not retryable from its current state")]
    NotRetryable(BatchId),

    #[error("batch {0} has exhausted its retry budget")]
    RetryExhausted(BatchId),

    #[error(transparent)]
    Store(#[from] BatchStoreError),
}

/// Outcome of a single activity processed by an [`crate::processor::ActivityProcessor`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Counted as an activity error; the batch continues.
    #[error("activity processing failed, retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Aborts the whole batch; it transitions to `Failed`.
    #[error("activity processing failed, terminal: {0}")]
    Terminal(#[source] anyhow::Error),
}

impl Categorizable for ProcessorError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
