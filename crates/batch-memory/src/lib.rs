//! In-memory [`BatchStore`] implementation.
//!
//! Exists for the same reason the teacher crate keeps its storage contract
//! separate from any one backend: "multiple implementations (SQL-backed
//! production, in-memory for tests) are interchangeable" (batch-core design
//! notes). This implementation honors every CAS and invariant contract
//! `BatchStore` documents, so tests written against it exercise the same
//! semantics `batch-postgres` must provide.

use std::collections::HashMap;

use async_trait::async_trait;
use batch_core::error::BatchStoreError;
use batch_core::model::{
    ActivityCursor, ActivityRef, Batch, BatchFilter, BatchId, BatchStatus, ProgressEvent,
};
use batch_core::store::{ActivityPage, BatchStore, StoreResult};
use chrono::Utc;
use tokio::sync::Mutex;

struct Row {
    batch: Batch,
    activities: Vec<ActivityRef>,
    events: Vec<ProgressEvent>,
}

/// Single-process, lock-protected `BatchStore`. Not durable across restarts;
/// intended for unit/integration tests and for embedding without Postgres.
#[derive(Default)]
pub struct InMemoryBatchStore {
    rows: Mutex<HashMap<BatchId, Row>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn insert(&self, batch: &Batch, activity_refs: &[ActivityRef]) -> StoreResult<BatchId> {
        let mut rows = self.rows.lock().await;

        if let Some(key) = &batch.idempotency_key {
            if let Some(existing) = rows.values().find(|row| {
                row.batch.tenant_id == batch.tenant_id
                    && row.batch.idempotency_key.as_deref() == Some(key.as_str())
            }) {
                return Ok(existing.batch.id);
            }
        }

        if rows.contains_key(&batch.id) {
            return Err(BatchStoreError::Conflict(batch.id));
        }
        rows.insert(
            batch.id,
            Row {
                batch: batch.clone(),
                activities: activity_refs.to_vec(),
                events: Vec::new(),
            },
        );
        Ok(batch.id)
    }

    async fn get(&self, batch_id: BatchId) -> StoreResult<Batch> {
        let rows = self.rows.lock().await;
        rows.get(&batch_id)
            .map(|row| row.batch.clone())
            .ok_or(BatchStoreError::NotFound(batch_id))
    }

    async fn list(&self, filter: &BatchFilter, limit: i64, offset: i64) -> StoreResult<Vec<Batch>> {
        let rows = self.rows.lock().await;
        let mut matched: Vec<Batch> = rows
            .values()
            .map(|row| row.batch.clone())
            .filter(|b| matches_filter(b, filter))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = offset.max(0) as usize;
        let end = (start + limit.max(0) as usize).min(matched.len());
        Ok(if start >= matched.len() {
            Vec::new()
        } else {
            matched[start..end].to_vec()
        })
    }

    async fn acquire_lease(
        &self,
        batch_id: BatchId,
        holder: &str,
        lease_duration: chrono::Duration,
        expected_status: &[BatchStatus],
    ) -> StoreResult<Batch> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&batch_id).ok_or(BatchStoreError::NotFound(batch_id))?;
        let now = Utc::now();

        if !expected_status.contains(&row.batch.status) {
            return Err(BatchStoreError::LeaseConflict(batch_id));
        }

        let lease_free = match row.batch.lease_holder {
            None => true,
            Some(_) => row
                .batch
                .lease_expires_at
                .map(|expires| now >= expires)
                .unwrap_or(false),
        };
        if !lease_free {
            return Err(BatchStoreError::LeaseConflict(batch_id));
        }

        row.batch.lease_holder = Some(holder.to_string());
        row.batch.lease_expires_at = Some(now + lease_duration);
        if row.batch.status == BatchStatus::Pending {
            row.batch.status = BatchStatus::Queued;
        }
        row.batch.updated_at = now;
        Ok(row.batch.clone())
    }

    async fn renew_lease(
        &self,
        batch_id: BatchId,
        holder: &str,
        lease_duration: chrono::Duration,
    ) -> StoreResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&batch_id).ok_or(BatchStoreError::NotFound(batch_id))?;

        if row.batch.lease_holder.as_deref() != Some(holder) {
            return Err(BatchStoreError::LeaseLost(batch_id));
        }
        // Renewal re-reads status so a holder in a different process than
        // whoever called `ControlApi::cancel` still learns of the
        // cancellation on its next heartbeat, not only via the lease_holder
        // clearing that accompanies the Cancelled transition.
        if row.batch.status == BatchStatus::Cancelled {
            return Err(BatchStoreError::LeaseLost(batch_id));
        }

        let now = Utc::now();
        row.batch.lease_expires_at = Some(now + lease_duration);
        row.batch.updated_at = now;
        Ok(())
    }

    async fn release_lease(&self, batch_id: BatchId, holder: &str) -> StoreResult<()> {
        let mut rows = self.rows.lock().await;
        let row = match rows.get_mut(&batch_id) {
            Some(row) => row,
            None => return Ok(()), // already gone; idempotent
        };

        if row.batch.lease_holder.as_deref() == Some(holder) {
            row.batch.lease_holder = None;
            row.batch.lease_expires_at = None;
            row.batch.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_status(
        &self,
        batch_id: BatchId,
        new_status: BatchStatus,
        require_holder: Option<&str>,
        require_from_status: Option<&[BatchStatus]>,
        reset_counters: bool,
    ) -> StoreResult<Batch> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&batch_id).ok_or(BatchStoreError::NotFound(batch_id))?;

        if row.batch.status.is_terminal() {
            return Err(BatchStoreError::Terminal(batch_id));
        }

        if let Some(holder) = require_holder {
            if row.batch.lease_holder.as_deref() != Some(holder) {
                return Err(BatchStoreError::LeaseLost(batch_id));
            }
        }

        if let Some(allowed) = require_from_status {
            if !allowed.contains(&row.batch.status) {
                return Err(BatchStoreError::LeaseConflict(batch_id));
            }
        }

        let now = Utc::now();
        row.batch.status = new_status;
        row.batch.updated_at = now;

        match new_status {
            BatchStatus::Processing if row.batch.started_at.is_none() => {
                row.batch.started_at = Some(now);
            }
            BatchStatus::Complete | BatchStatus::Failed | BatchStatus::Cancelled => {
                row.batch.completed_at = Some(now);
                row.batch.lease_holder = None;
                row.batch.lease_expires_at = None;
            }
            BatchStatus::Pending => {
                row.batch.started_at = None;
                row.batch.completed_at = None;
                row.batch.lease_holder = None;
                row.batch.lease_expires_at = None;
                row.batch.retry_count += 1;
                row.batch.resume_cursor = ActivityCursor::START;
                if reset_counters {
                    row.batch.success_count = 0;
                    row.batch.error_count = 0;
                    row.batch.total_emissions = 0.0;
                }
            }
            _ => {}
        }

        Ok(row.batch.clone())
    }

    async fn increment_progress(
        &self,
        batch_id: BatchId,
        success_delta: i64,
        error_delta: i64,
        emissions_delta: f64,
        advance_to: Option<ActivityCursor>,
    ) -> StoreResult<Batch> {
        let mut rows = self.rows.lock().await;
        let row = rows.get_mut(&batch_id).ok_or(BatchStoreError::NotFound(batch_id))?;

        let new_success = row.batch.success_count + success_delta;
        let new_error = row.batch.error_count + error_delta;
        if new_success + new_error > row.batch.activity_count {
            return Err(BatchStoreError::InvariantViolation {
                batch: batch_id,
                reason: format!(
                    "success({new_success}) + error({new_error}) > activity_count({})",
                    row.batch.activity_count
                ),
            });
        }

        if let Some(cursor) = advance_to {
            row.batch.resume_cursor = cursor;
        }
        row.batch.success_count = new_success.max(0);
        row.batch.error_count = new_error.max(0);
        row.batch.total_emissions = (row.batch.total_emissions + emissions_delta).max(0.0);
        row.batch.updated_at = Utc::now();
        Ok(row.batch.clone())
    }

    async fn list_activity_refs(
        &self,
        batch_id: BatchId,
        cursor: ActivityCursor,
        limit: i64,
    ) -> StoreResult<ActivityPage> {
        let rows = self.rows.lock().await;
        let row = rows.get(&batch_id).ok_or(BatchStoreError::NotFound(batch_id))?;

        let mut remaining: Vec<&ActivityRef> = row
            .activities
            .iter()
            .filter(|a| a.sequence >= cursor.0)
            .collect();
        remaining.sort_by_key(|a| a.sequence);

        let take = limit.max(0) as usize;
        let items: Vec<ActivityRef> = remaining.iter().take(take).map(|a| (*a).clone()).collect();
        let next_cursor = remaining
            .get(take)
            .map(|next| ActivityCursor(next.sequence));

        Ok(ActivityPage { items, next_cursor })
    }

    async fn append_progress_event(&self, event: ProgressEvent) -> StoreResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&event.batch_id) {
            row.events.push(event);
        }
        Ok(())
    }

    async fn delete(&self, batch_id: BatchId, force: bool) -> StoreResult<()> {
        let mut rows = self.rows.lock().await;
        let row = rows.get(&batch_id).ok_or(BatchStoreError::NotFound(batch_id))?;
        if !force && !row.batch.status.is_terminal() {
            return Err(BatchStoreError::Terminal(batch_id));
        }
        rows.remove(&batch_id);
        Ok(())
    }

    async fn find_eligible(&self, now: chrono::DateTime<Utc>, max_count: i64) -> StoreResult<Vec<Batch>> {
        let rows = self.rows.lock().await;
        let mut eligible: Vec<Batch> = rows
            .values()
            .map(|row| row.batch.clone())
            .filter(|b| b.is_eligible(now))
            .collect();

        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.0.cmp(&b.id.0))
        });
        eligible.truncate(max_count.max(0) as usize);
        Ok(eligible)
    }
}

fn matches_filter(batch: &Batch, filter: &BatchFilter) -> bool {
    if let Some(t) = filter.tenant_id {
        if batch.tenant_id != t {
            return false;
        }
    }
    if let Some(w) = filter.workspace_id {
        if batch.workspace_id != w {
            return false;
        }
    }
    if let Some(statuses) = &filter.statuses {
        if !statuses.contains(&batch.status) {
            return false;
        }
    }
    if let Some(after) = filter.created_after {
        if batch.created_at < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if batch.created_at > before {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_testing::fixtures::{sample_batch_with_activities, sample_batch_with_activities_for};

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(3);
        store.insert(&batch, &refs).await.unwrap();

        let fetched = store.get(batch.id).await.unwrap();
        assert_eq!(fetched.id, batch.id);
        assert_eq!(fetched.activity_count, 3);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(1);
        store.insert(&batch, &refs).await.unwrap();
        let err = store.insert(&batch, &refs).await.unwrap_err();
        assert!(matches!(err, BatchStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn insert_with_same_idempotency_key_dedupes_to_existing_batch() {
        let store = InMemoryBatchStore::new();
        let (mut first, first_refs) = sample_batch_with_activities(2);
        first.idempotency_key = Some("checkout-123".into());
        let returned = store.insert(&first, &first_refs).await.unwrap();
        assert_eq!(returned, first.id);

        let (mut second, second_refs) =
            sample_batch_with_activities_for(first.tenant_id, first.workspace_id, 2);
        second.idempotency_key = Some("checkout-123".into());
        let returned = store.insert(&second, &second_refs).await.unwrap();
        assert_eq!(returned, first.id);

        // No second row was created.
        let err = store.get(second.id).await.unwrap_err();
        assert!(matches!(err, BatchStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn insert_with_same_key_different_tenant_does_not_dedupe() {
        let store = InMemoryBatchStore::new();
        let (mut first, first_refs) = sample_batch_with_activities(1);
        first.idempotency_key = Some("shared-key".into());
        store.insert(&first, &first_refs).await.unwrap();

        let (mut second, second_refs) = sample_batch_with_activities(1);
        second.idempotency_key = Some("shared-key".into());
        let returned = store.insert(&second, &second_refs).await.unwrap();
        assert_eq!(returned, second.id);
        assert_ne!(returned, first.id);
    }

    #[tokio::test]
    async fn acquire_lease_promotes_pending_to_queued() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(2);
        store.insert(&batch, &refs).await.unwrap();

        let leased = store
            .acquire_lease(
                batch.id,
                "holder-a",
                chrono::Duration::seconds(60),
                &[BatchStatus::Pending, BatchStatus::Queued],
            )
            .await
            .unwrap();
        assert_eq!(leased.status, BatchStatus::Queued);
        assert_eq!(leased.lease_holder.as_deref(), Some("holder-a"));
    }

    #[tokio::test]
    async fn acquire_lease_conflict_on_second_holder() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(2);
        store.insert(&batch, &refs).await.unwrap();

        let expected = [BatchStatus::Pending, BatchStatus::Queued];
        store
            .acquire_lease(batch.id, "holder-a", chrono::Duration::seconds(60), &expected)
            .await
            .unwrap();

        let err = store
            .acquire_lease(batch.id, "holder-b", chrono::Duration::seconds(60), &expected)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchStoreError::LeaseConflict(_)));
    }

    #[tokio::test]
    async fn expired_lease_is_acquirable_by_new_holder() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(2);
        store.insert(&batch, &refs).await.unwrap();

        let expected = [BatchStatus::Pending, BatchStatus::Queued, BatchStatus::Processing];
        store
            .acquire_lease(batch.id, "holder-a", chrono::Duration::seconds(60), &expected)
            .await
            .unwrap();
        store
            .update_status(batch.id, BatchStatus::Processing, Some("holder-a"), None, false)
            .await
            .unwrap();

        // Force expiry by renewing with a negative duration.
        store
            .renew_lease(batch.id, "holder-a", chrono::Duration::seconds(-1))
            .await
            .unwrap();

        let leased = store
            .acquire_lease(batch.id, "holder-b", chrono::Duration::seconds(60), &expected)
            .await
            .unwrap();
        assert_eq!(leased.lease_holder.as_deref(), Some("holder-b"));
    }

    #[tokio::test]
    async fn increment_progress_rejects_invariant_violation() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(2);
        store.insert(&batch, &refs).await.unwrap();

        store
            .increment_progress(batch.id, 2, 0, 1.0, None)
            .await
            .unwrap();
        let err = store
            .increment_progress(batch.id, 1, 0, 0.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchStoreError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn list_activity_refs_paginates_with_resume_cursor() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(5);
        store.insert(&batch, &refs).await.unwrap();

        let page1 = store
            .list_activity_refs(batch.id, ActivityCursor::START, 2)
            .await
            .unwrap();
        assert_eq!(page1.items.len(), 2);
        let cursor = page1.next_cursor.unwrap();

        let page2 = store.list_activity_refs(batch.id, cursor, 2).await.unwrap();
        assert_eq!(page2.items.len(), 2);

        let cursor2 = page2.next_cursor.unwrap();
        let page3 = store.list_activity_refs(batch.id, cursor2, 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);
        assert!(page3.next_cursor.is_none());
    }

    #[tokio::test]
    async fn find_eligible_orders_by_priority_then_created_at() {
        let store = InMemoryBatchStore::new();
        let (mut low, refs_low) = sample_batch_with_activities(1);
        low.priority = 1;
        let (mut high, refs_high) = sample_batch_with_activities(1);
        high.priority = 9;
        high.created_at = low.created_at + chrono::Duration::seconds(1);
        high.updated_at = high.created_at;

        store.insert(&low, &refs_low).await.unwrap();
        store.insert(&high, &refs_high).await.unwrap();

        let eligible = store.find_eligible(Utc::now(), 10).await.unwrap();
        assert_eq!(eligible[0].id, high.id);
        assert_eq!(eligible[1].id, low.id);
    }

    #[tokio::test]
    async fn delete_rejects_non_terminal_without_force() {
        let store = InMemoryBatchStore::new();
        let (batch, refs) = sample_batch_with_activities(1);
        store.insert(&batch, &refs).await.unwrap();

        let err = store.delete(batch.id, false).await.unwrap_err();
        assert!(matches!(err, BatchStoreError::Terminal(_)));

        store.delete(batch.id, true).await.unwrap();
        let err = store.get(batch.id).await.unwrap_err();
        assert!(matches!(err, BatchStoreError::NotFound(_)));
    }
}
