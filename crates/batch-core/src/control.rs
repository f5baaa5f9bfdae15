//! Non-polling control verbs: cancel, retry, delete, query (spec §4.H).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::instrument;

use crate::config::RetryCounterPolicy;
use crate::error::{BatchStoreError, ControlError};
use crate::model::{Batch, BatchFilter, BatchId, BatchStatus};
use crate::store::BatchStore;

/// Percent-complete and ETA derived from a batch's counters and the
/// scheduler's rolling average activity duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub percent_complete: f64,
    pub success_count: i64,
    pub error_count: i64,
    pub activity_count: i64,
    pub estimated_remaining_secs: Option<f64>,
}

/// Cooperative cancellation signal for in-process workers. `CancelBatch`
/// flips the store's status and, if the holder is found in this registry
/// (i.e. leased by this process), additionally cancels its token so the
/// worker does not have to wait for its next store read. A remote holder
/// (another process) detects cancellation on its own next renewal, since
/// renewal re-reads status.
#[derive(Default, Clone)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<BatchId, tokio_util::sync::CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, batch_id: BatchId, token: tokio_util::sync::CancellationToken) {
        self.tokens.insert(batch_id, token);
    }

    pub fn unregister(&self, batch_id: BatchId) {
        self.tokens.remove(&batch_id);
    }

    pub fn signal(&self, batch_id: BatchId) -> bool {
        if let Some(token) = self.tokens.get(&batch_id) {
            token.cancel();
            true
        } else {
            false
        }
    }
}

pub struct ControlApi<S> {
    store: Arc<S>,
    cancellation: CancellationRegistry,
    retry_counter_policy: RetryCounterPolicy,
    /// Rolling average activity duration, seconds-per-activity, used to
    /// derive `GetProgress`'s ETA. Supplied by the embedding application
    /// (typically sourced from `StatsCollector`), kept separate from the
    /// store so `ControlApi` stays storage-agnostic.
    avg_activity_duration_secs: f64,
}

impl<S> ControlApi<S>
where
    S: BatchStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        cancellation: CancellationRegistry,
        retry_counter_policy: RetryCounterPolicy,
        avg_activity_duration_secs: f64,
    ) -> Self {
        Self {
            store,
            cancellation,
            retry_counter_policy,
            avg_activity_duration_secs,
        }
    }

    /// If non-terminal, transitions via CAS to `Cancelled`. If currently
    /// leased by this process, additionally signals the in-process worker.
    #[instrument(skip(self))]
    pub async fn cancel(&self, batch_id: BatchId) -> Result<(), ControlError> {
        let batch = self.get_or_not_found(batch_id).await?;
        if batch.status.is_terminal() {
            return Err(ControlError::Terminal(batch_id));
        }

        self.store
            .update_status(batch_id, BatchStatus::Cancelled, None, None, false)
            .await?;

        self.cancellation.signal(batch_id);
        Ok(())
    }

    /// Allowed only from `Failed` or `Cancelled`; requires `retry_count <
    /// max_retries`. Atomically increments `retry_count`, applies the
    /// configured counter policy, clears the lease, and resets status to
    /// `Pending` — all in the single `update_status` transaction, so no
    /// reader ever observes the counters reset against a status that hasn't
    /// moved yet (spec §4.H, §7).
    #[instrument(skip(self))]
    pub async fn retry(&self, batch_id: BatchId) -> Result<(), ControlError> {
        let batch = self.get_or_not_found(batch_id).await?;

        if !matches!(batch.status, BatchStatus::Failed | BatchStatus::Cancelled) {
            return Err(ControlError::NotRetryable(batch_id));
        }
        if batch.retry_count >= batch.max_retries {
            return Err(ControlError::RetryExhausted(batch_id));
        }

        let reset_counters = matches!(self.retry_counter_policy, RetryCounterPolicy::Reset);

        self.store
            .update_status(batch_id, BatchStatus::Pending, None, None, reset_counters)
            .await?;

        Ok(())
    }

    /// Terminal-only unless `force` is set. Cascades to activity refs and
    /// progress events.
    #[instrument(skip(self))]
    pub async fn delete(&self, batch_id: BatchId, force: bool) -> Result<(), ControlError> {
        match self.store.delete(batch_id, force).await {
            Ok(()) => Ok(()),
            Err(BatchStoreError::NotFound(id)) => Err(ControlError::NotFound(id)),
            Err(BatchStoreError::Terminal(id)) => Err(ControlError::Terminal(id)),
            Err(other) => Err(ControlError::Store(other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_progress(&self, batch_id: BatchId) -> Result<ProgressSnapshot, ControlError> {
        let batch = self.get_or_not_found(batch_id).await?;
        let remaining = (batch.activity_count - batch.success_count - batch.error_count).max(0);
        let estimated_remaining_secs = if self.avg_activity_duration_secs > 0.0 {
            Some(remaining as f64 * self.avg_activity_duration_secs)
        } else {
            None
        };

        Ok(ProgressSnapshot {
            percent_complete: batch.percent_complete(),
            success_count: batch.success_count,
            error_count: batch.error_count,
            activity_count: batch.activity_count,
            estimated_remaining_secs,
        })
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> Result<Batch, ControlError> {
        self.get_or_not_found(batch_id).await
    }

    pub async fn list_batches(
        &self,
        filter: &BatchFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Batch>, ControlError> {
        Ok(self.store.list(filter, limit, offset).await?)
    }

    async fn get_or_not_found(&self, batch_id: BatchId) -> Result<Batch, ControlError> {
        match self.store.get(batch_id).await {
            Ok(batch) => Ok(batch),
            Err(BatchStoreError::NotFound(id)) => Err(ControlError::NotFound(id)),
            Err(other) => Err(ControlError::Store(other)),
        }
    }
}
