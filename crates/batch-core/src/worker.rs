//! Processes a single leased batch end to end (spec §4.C).
//!
//! The worker never calls back into the scheduler except through the
//! [`BatchStore`] — the same message-passing discipline the teacher's design
//! notes call out ("cyclic references between Scheduler and Worker → broken
//! by message-passing: workers receive a handle and a cancellation context").

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::error::{BatchStoreError, ProcessorError};
use crate::lease::LeaseManager;
use crate::model::{ActivityCursor, BatchId, BatchStatus, ProgressEvent, ProgressEventKind};
use crate::processor::ActivityProcessor;
use crate::sink::ProgressEventSink;
use crate::stats::StatsCollector;
use crate::store::{BatchStore, StoreResult};

/// Why a worker stopped processing its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Complete,
    Failed,
    Cancelled,
    /// The initial CAS into `Processing` lost the race (another worker, or a
    /// concurrent cancel); the caller should simply drop this assignment.
    PreemptedBeforeStart,
    /// Renewal reported [`BatchStoreError::LeaseLost`]; the worker abandoned
    /// in-memory state without writing further.
    LeaseLost,
}

/// Processes one leased batch. Constructed fresh per assignment by the
/// [`crate::pool::WorkerPool`]; holds no state across batches.
pub struct Worker<S, P> {
    store: Arc<S>,
    processor: Arc<P>,
    lease: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ProgressEventSink>,
    stats: Arc<StatsCollector>,
    config: WorkerConfig,
}

impl<S, P> Worker<S, P>
where
    S: BatchStore + 'static,
    P: ActivityProcessor + 'static,
{
    pub fn new(
        store: Arc<S>,
        processor: Arc<P>,
        lease: Arc<LeaseManager>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ProgressEventSink>,
        stats: Arc<StatsCollector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            lease,
            clock,
            sink,
            stats,
            config,
        }
    }

    /// Drives `batch_id` (already leased by the caller) through steps 2-6 of
    /// spec §4.C: transition to `Processing`, start the renewal ticker,
    /// iterate activities in stable order, drain to a terminal state, and
    /// release the lease.
    #[instrument(skip(self, cancel), fields(batch_id = %batch_id))]
    pub async fn run(&self, batch_id: BatchId, cancel: CancellationToken) -> WorkerOutcome {
        // `Processing` is included alongside `Queued`/`Pending` so a worker
        // that just won a stale, expired lease (spec §8 scenario 4) can
        // re-enter a batch its predecessor never got to finish; passing
        // `require_holder` here guarantees it's only ever a self-transition
        // for whichever holder the lease acquisition just assigned.
        let batch = match self
            .store
            .update_status(
                batch_id,
                BatchStatus::Processing,
                Some(self.lease.holder_id()),
                Some(&[
                    BatchStatus::Queued,
                    BatchStatus::Pending,
                    BatchStatus::Processing,
                ]),
                false,
            )
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "CAS into Processing failed; releasing lease");
                let _ = self.lease.release(batch_id).await;
                return WorkerOutcome::PreemptedBeforeStart;
            }
        };

        if batch.started_at.is_none() {
            let _ = self
                .emit(batch_id, ProgressEventKind::Processing, serde_json::json!({}))
                .await;
        }

        let started_at = self.clock.now();
        let renewal = self.spawn_renewal_ticker(batch_id, cancel.clone());

        let outcome = self.drain(batch_id, batch.resume_cursor, cancel.clone()).await;

        renewal.abort();

        let duration_secs = (self.clock.now() - started_at).num_milliseconds() as f64 / 1000.0;
        match &outcome {
            DrainOutcome::Complete => {
                self.finish(batch_id, BatchStatus::Complete, ProgressEventKind::Complete)
                    .await;
                self.stats.record_completed(duration_secs);
                WorkerOutcome::Complete
            }
            DrainOutcome::TerminalFailure(reason) => {
                self.finish_with_reason(
                    batch_id,
                    BatchStatus::Failed,
                    ProgressEventKind::Failed,
                    reason,
                )
                .await;
                self.stats.record_failed();
                WorkerOutcome::Failed
            }
            DrainOutcome::Cancelled => {
                self.finish(batch_id, BatchStatus::Cancelled, ProgressEventKind::Cancelled)
                    .await;
                self.stats.record_cancelled();
                WorkerOutcome::Cancelled
            }
            DrainOutcome::LeaseLost => {
                warn!("lease lost mid-batch; abandoning without further writes");
                self.stats.record_lease_timeout();
                WorkerOutcome::LeaseLost
            }
        }
    }

    fn spawn_renewal_ticker(
        &self,
        batch_id: BatchId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let lease = self.lease.clone();
        let interval = self.lease.renewal_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(BatchStoreError::LeaseLost(_)) = lease.renew(batch_id).await {
                            cancel.cancel();
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn drain(
        &self,
        batch_id: BatchId,
        start_cursor: ActivityCursor,
        cancel: CancellationToken,
    ) -> DrainOutcome {
        let mut cursor = start_cursor;
        let flush_n = self.config.progress_flush_n.max(1) as i64;
        let mut since_flush: i64 = 0;
        let mut last_flush = self.clock.now();

        loop {
            if cancel.is_cancelled() {
                return DrainOutcome::Cancelled;
            }

            let page = match self.store.list_activity_refs(batch_id, cursor, 100).await {
                Ok(page) => page,
                Err(BatchStoreError::LeaseLost(_)) => return DrainOutcome::LeaseLost,
                Err(err) => {
                    error!(error = %err, "failed to list activity refs");
                    return DrainOutcome::TerminalFailure(err.to_string());
                }
            };

            if page.items.is_empty() && page.next_cursor.is_none() {
                return DrainOutcome::Complete;
            }

            for activity in &page.items {
                if cancel.is_cancelled() {
                    return DrainOutcome::Cancelled;
                }

                let next_cursor = ActivityCursor(activity.sequence + 1);
                match self.processor.process(activity).await {
                    Ok(emissions) => {
                        match self
                            .store
                            .increment_progress(batch_id, 1, 0, emissions, Some(next_cursor))
                            .await
                        {
                            Ok(_) => {
                                self.stats.record_activity(true);
                            }
                            Err(BatchStoreError::LeaseLost(_)) => return DrainOutcome::LeaseLost,
                            Err(BatchStoreError::InvariantViolation { reason, .. }) => {
                                error!(reason, "counter invariant violated");
                                return DrainOutcome::TerminalFailure(reason);
                            }
                            Err(err) => return DrainOutcome::TerminalFailure(err.to_string()),
                        }
                    }
                    Err(ProcessorError::Retryable(reason)) => {
                        match self
                            .store
                            .increment_progress(batch_id, 0, 1, 0.0, Some(next_cursor))
                            .await
                        {
                            Ok(_) => {
                                self.stats.record_activity(false);
                                warn!(activity_id = %activity.activity_id, %reason, "activity failed, retryable");
                            }
                            Err(BatchStoreError::LeaseLost(_)) => return DrainOutcome::LeaseLost,
                            Err(err) => return DrainOutcome::TerminalFailure(err.to_string()),
                        }
                    }
                    Err(ProcessorError::Terminal(reason)) => {
                        return DrainOutcome::TerminalFailure(reason.to_string());
                    }
                }

                since_flush += 1;
                let elapsed = self.clock.now() - last_flush;
                if since_flush >= flush_n || elapsed >= self.config.progress_flush_t_chrono() {
                    self.emit_snapshot(batch_id).await;
                    since_flush = 0;
                    last_flush = self.clock.now();
                }
            }

            cursor = match page.next_cursor {
                Some(next) => next,
                None => return DrainOutcome::Complete,
            };
        }
    }

    async fn emit_snapshot(&self, batch_id: BatchId) {
        let _ = self
            .emit(batch_id, ProgressEventKind::Snapshot, serde_json::json!({}))
            .await;
    }

    async fn finish(&self, batch_id: BatchId, status: BatchStatus, kind: ProgressEventKind) {
        self.finish_inner(batch_id, status, kind, None).await;
    }

    async fn finish_with_reason(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        kind: ProgressEventKind,
        reason: &str,
    ) {
        self.finish_inner(batch_id, status, kind, Some(reason)).await;
    }

    async fn finish_inner(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        kind: ProgressEventKind,
        reason: Option<&str>,
    ) {
        if let Err(err) = self
            .store
            .update_status(batch_id, status, Some(self.lease.holder_id()), None, false)
            .await
        {
            error!(error = %err, "failed to persist terminal status");
        }

        let payload = match reason {
            Some(r) => serde_json::json!({ "reason": r }),
            None => serde_json::json!({}),
        };
        let _ = self.emit(batch_id, kind, payload).await;

        if let Err(err) = self.lease.release(batch_id).await {
            error!(error = %err, "failed to release lease after terminal transition");
        }

        info!(status = %status, "batch reached terminal state");
    }

    async fn emit(
        &self,
        batch_id: BatchId,
        kind: ProgressEventKind,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        let event = ProgressEvent {
            batch_id,
            kind,
            at: self.clock.now(),
            payload,
        };
        self.sink.publish(&event).await;
        self.store.append_progress_event(event).await
    }
}

enum DrainOutcome {
    Complete,
    TerminalFailure(String),
    Cancelled,
    LeaseLost,
}

impl WorkerConfig {
    fn progress_flush_t_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.progress_flush_t).unwrap_or_else(|_| chrono::Duration::seconds(5))
    }
}
