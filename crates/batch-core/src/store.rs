//! The [`BatchStore`] contract: durable persistence of batches, activity
//! references, and progress events, plus the lease primitives every backend
//! must implement atomically.
//!
//! Mirrors the shape of `seesaw-job-postgres::JobStore` (`claim_ready`,
//! `mark_succeeded`, `mark_failed`, `heartbeat`) generalized to the richer
//! batch lifecycle spec §4.A requires: CAS status transitions, additive
//! counter updates with an enforced invariant, and paginated activity
//! iteration for crash-safe resume.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BatchStoreError;
use crate::model::{
    ActivityCursor, ActivityRef, Batch, BatchFilter, BatchId, BatchStatus, ProgressEvent,
};

pub type StoreResult<T> = Result<T, BatchStoreError>;

/// A page of activity references plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct ActivityPage {
    pub items: Vec<ActivityRef>,
    pub next_cursor: Option<ActivityCursor>,
}

/// Durable persistence of batches, activity references, and progress events.
///
/// Implementations: [`batch_postgres::PgBatchStore`] (production,
/// `sqlx::PgPool`) and [`batch_memory::InMemoryBatchStore`] (tests). Both
/// honor the same CAS and invariant contracts below so the rest of the core
/// (lease manager, worker, scheduler) is storage-agnostic.
///
/// [`batch_postgres::PgBatchStore`]: ../batch_postgres/struct.PgBatchStore.html
/// [`batch_memory::InMemoryBatchStore`]: ../batch_memory/struct.InMemoryBatchStore.html
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Atomically creates the batch row and its activity refs in one
    /// transaction. Fails with [`BatchStoreError::Conflict`] if the id
    /// already exists.
    ///
    /// When `batch.idempotency_key` is set and a batch with the same
    /// `(tenant_id, idempotency_key)` already exists, this is a no-op: no
    /// new row is written and the existing batch's id is returned instead of
    /// `batch.id`, per spec §4.G's "admission is idempotent only if the
    /// caller supplies an idempotencyKey the store uses to dedupe".
    async fn insert(&self, batch: &Batch, activity_refs: &[ActivityRef]) -> StoreResult<BatchId>;

    /// Returns the full batch, or [`BatchStoreError::NotFound`] if absent.
    async fn get(&self, batch_id: BatchId) -> StoreResult<Batch>;

    /// Lists batches matching `filter`, newest first, bounded by
    /// `limit`/`offset`.
    async fn list(&self, filter: &BatchFilter, limit: i64, offset: i64) -> StoreResult<Vec<Batch>>;

    /// Atomically, iff the row's current status is in `expected_status` and
    /// (`lease_holder` is null OR `lease_expires_at < now`): sets
    /// `lease_holder = holder`, `lease_expires_at = now + lease_duration`,
    /// and if the status was `Pending` promotes it to `Queued`.
    ///
    /// Returns the updated batch, or [`BatchStoreError::LeaseConflict`] if
    /// another holder won the race.
    async fn acquire_lease(
        &self,
        batch_id: BatchId,
        holder: &str,
        lease_duration: chrono::Duration,
        expected_status: &[BatchStatus],
    ) -> StoreResult<Batch>;

    /// Atomically, iff `lease_holder == holder`, extends
    /// `lease_expires_at = now + lease_duration`. Fails with
    /// [`BatchStoreError::LeaseLost`] otherwise.
    async fn renew_lease(
        &self,
        batch_id: BatchId,
        holder: &str,
        lease_duration: chrono::Duration,
    ) -> StoreResult<()>;

    /// Atomically, iff `lease_holder == holder`, clears the lease fields.
    /// Idempotent: never fails when the lease is already released.
    async fn release_lease(&self, batch_id: BatchId, holder: &str) -> StoreResult<()>;

    /// Atomic CAS transition to `new_status`. Rejects transitions out of
    /// terminal states. When `require_holder` is set, rejects the
    /// transition unless the row's current `lease_holder` matches.
    ///
    /// When `new_status` is `Pending` and `reset_counters` is set, this also
    /// zeroes `success_count`, `error_count`, and `total_emissions` in the
    /// same transaction as the status/lease/cursor reset, so
    /// [`crate::control::ControlApi::retry`]'s counter policy and its
    /// `Pending` transition land as one atomic write (spec §4.H) rather than
    /// two, leaving no window where a concurrent reader observes
    /// zeroed counters against a still-terminal status or vice versa.
    async fn update_status(
        &self,
        batch_id: BatchId,
        new_status: BatchStatus,
        require_holder: Option<&str>,
        require_from_status: Option<&[BatchStatus]>,
        reset_counters: bool,
    ) -> StoreResult<Batch>;

    /// Atomic additive update to `success_count`/`error_count`/`total_emissions`,
    /// plus an optional advance of the batch's resume cursor. Returns
    /// [`BatchStoreError::InvariantViolation`] if the result would make
    /// `success_count + error_count > activity_count`.
    ///
    /// `advance_to`, when set, is a monotonic write: implementations must
    /// apply it before the counter deltas in the same transaction, per
    /// spec §4.B's "cursor writes ordered before counter increments" rule,
    /// so a crash between the two never leaves the cursor ahead of what the
    /// counters reflect.
    async fn increment_progress(
        &self,
        batch_id: BatchId,
        success_delta: i64,
        error_delta: i64,
        emissions_delta: f64,
        advance_to: Option<ActivityCursor>,
    ) -> StoreResult<Batch>;

    /// Stable, paginated iteration over a batch's activity references,
    /// resumable after a crash via the returned cursor.
    async fn list_activity_refs(
        &self,
        batch_id: BatchId,
        cursor: ActivityCursor,
        limit: i64,
    ) -> StoreResult<ActivityPage>;

    /// Append-only log write. Best-effort: a failure here must not roll back
    /// or partially apply any other mutation.
    async fn append_progress_event(&self, event: ProgressEvent) -> StoreResult<()>;

    /// Cascades to activity refs and progress events in one transaction.
    /// Rejects non-terminal batches unless `force` is set.
    async fn delete(&self, batch_id: BatchId, force: bool) -> StoreResult<()>;

    /// Returns up to `max_count` batches eligible for dispatch (spec §3),
    /// ordered by `(priority desc, created_at asc, batch_id asc)`.
    async fn find_eligible(&self, now: DateTime<Utc>, max_count: i64) -> StoreResult<Vec<Batch>>;
}
