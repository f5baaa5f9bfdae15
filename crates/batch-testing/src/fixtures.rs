//! Batch/activity builders for tests.

use batch_core::model::{
    ActivityCursor, ActivityId, ActivityRef, Batch, BatchId, BatchStatus, TenantId, WorkspaceId,
};
use chrono::Utc;

/// A `Pending` batch with `count` activities, default priority 5 and
/// max_retries 3, owned by freshly-generated tenant/workspace ids.
pub fn sample_batch_with_activities(count: i64) -> (Batch, Vec<ActivityRef>) {
    sample_batch_with_activities_for(TenantId::new(), WorkspaceId::new(), count)
}

pub fn sample_batch_with_activities_for(
    tenant_id: TenantId,
    workspace_id: WorkspaceId,
    count: i64,
) -> (Batch, Vec<ActivityRef>) {
    let now = Utc::now();
    let batch_id = BatchId::new();

    let batch = Batch {
        id: batch_id,
        tenant_id,
        workspace_id,
        activity_count: count,
        success_count: 0,
        error_count: 0,
        total_emissions: 0.0,
        priority: 5,
        max_retries: 3,
        retry_count: 0,
        status: BatchStatus::Pending,
        resume_cursor: ActivityCursor::START,
        lease_holder: None,
        lease_expires_at: None,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        idempotency_key: None,
    };

    let refs = (0..count)
        .map(|seq| ActivityRef {
            activity_id: ActivityId::new(),
            batch_id,
            sequence: seq,
            metadata: None,
        })
        .collect();

    (batch, refs)
}
