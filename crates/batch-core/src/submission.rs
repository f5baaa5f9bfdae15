//! Admission entry point used by the external request layer to create and
//! validate new batches (spec §4.G).

use std::sync::Arc;

use tracing::instrument;

use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::error::SubmissionError;
use crate::idgen::IdGenerator;
use crate::model::{
    ActivityCursor, ActivityId, ActivityRef, Batch, BatchId, BatchStatus, ProgressEvent,
    ProgressEventKind, TenantId, WorkspaceId,
};
use crate::sink::ProgressEventSink;
use crate::stats::StatsCollector;
use crate::store::BatchStore;

/// Caller-supplied payload for one activity at submission time.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub metadata: Option<serde_json::Value>,
}

/// Optional fields for [`SubmissionApi::submit_batch`]; unset fields take the
/// `AdmissionConfig` defaults.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Option<i16>,
    pub max_retries: Option<i32>,
    pub idempotency_key: Option<String>,
}

pub struct SubmissionApi<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sink: Arc<dyn ProgressEventSink>,
    stats: Arc<StatsCollector>,
    config: AdmissionConfig,
}

impl<S> SubmissionApi<S>
where
    S: BatchStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        sink: Arc<dyn ProgressEventSink>,
        stats: Arc<StatsCollector>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            sink,
            stats,
            config,
        }
    }

    /// Validates and persists a new batch. Rejects empty or oversized
    /// activity lists and out-of-range priority with
    /// [`SubmissionError::InvalidInput`]; never retries internally.
    #[instrument(skip(self, activities))]
    pub async fn submit_batch(
        &self,
        tenant_id: TenantId,
        workspace_id: WorkspaceId,
        activities: Vec<NewActivity>,
        opts: SubmitOptions,
    ) -> Result<BatchId, SubmissionError> {
        if activities.is_empty() {
            return Err(SubmissionError::InvalidInput(
                "activity list must not be empty".into(),
            ));
        }
        if activities.len() as i64 > self.config.max_activities_per_batch {
            return Err(SubmissionError::InvalidInput(format!(
                "activity count {} exceeds max {}",
                activities.len(),
                self.config.max_activities_per_batch
            )));
        }

        let priority = opts.priority.unwrap_or(self.config.default_priority);
        if !(0..=10).contains(&priority) {
            return Err(SubmissionError::InvalidInput(format!(
                "priority {priority} out of range [0,10]"
            )));
        }

        let max_retries = opts.max_retries.unwrap_or(self.config.default_max_retries);
        if max_retries < 0 {
            return Err(SubmissionError::InvalidInput(
                "max_retries must be >= 0".into(),
            ));
        }

        let batch_id = self.ids.new_batch_id();
        let now = self.clock.now();

        let batch = Batch {
            id: batch_id,
            tenant_id,
            workspace_id,
            activity_count: activities.len() as i64,
            success_count: 0,
            error_count: 0,
            total_emissions: 0.0,
            priority,
            max_retries,
            retry_count: 0,
            status: BatchStatus::Pending,
            resume_cursor: ActivityCursor::START,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            idempotency_key: opts.idempotency_key,
        };

        let refs: Vec<ActivityRef> = activities
            .into_iter()
            .enumerate()
            .map(|(i, a)| ActivityRef {
                activity_id: ActivityId::new(),
                batch_id,
                sequence: i as i64,
                metadata: a.metadata,
            })
            .collect();

        let inserted_id = self.store.insert(&batch, &refs).await?;
        if inserted_id != batch_id {
            // An existing batch already claimed this idempotency key; this
            // submission is a duplicate and must not count as a new one.
            return Ok(inserted_id);
        }
        self.stats.record_submitted();

        let event = ProgressEvent {
            batch_id,
            kind: ProgressEventKind::Submitted,
            at: self.clock.now(),
            payload: serde_json::json!({ "activity_count": refs.len() }),
        };
        self.sink.publish(&event).await;
        let _ = self.store.append_progress_event(event).await;

        Ok(batch_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use batch_memory::InMemoryBatchStore;

    use super::*;
    use crate::clock::SystemClock;
    use crate::idgen::UuidGenerator;
    use crate::model::{TenantId, WorkspaceId};
    use crate::sink::NoOpEventSink;

    fn api(store: Arc<InMemoryBatchStore>) -> SubmissionApi<InMemoryBatchStore> {
        SubmissionApi::new(
            store,
            Arc::new(SystemClock),
            Arc::new(UuidGenerator),
            Arc::new(NoOpEventSink),
            Arc::new(StatsCollector::default()),
            AdmissionConfig::default(),
        )
    }

    #[tokio::test]
    async fn resubmitting_with_same_idempotency_key_returns_existing_batch() {
        let store = Arc::new(InMemoryBatchStore::new());
        let api = api(store.clone());
        let tenant_id = TenantId::new();
        let workspace_id = WorkspaceId::new();
        let opts = SubmitOptions {
            idempotency_key: Some("invoice-42".into()),
            ..Default::default()
        };

        let first = api
            .submit_batch(
                tenant_id,
                workspace_id,
                vec![NewActivity { metadata: None }],
                opts.clone(),
            )
            .await
            .unwrap();

        let second = api
            .submit_batch(
                tenant_id,
                workspace_id,
                vec![NewActivity { metadata: None }],
                opts,
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        let batches = store
            .list(&crate::model::BatchFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
    }
}
