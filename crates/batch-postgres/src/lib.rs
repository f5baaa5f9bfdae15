//! PostgreSQL implementation of the carbon batch processing core's
//! `BatchStore`.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE batches (
//!     id                UUID PRIMARY KEY,
//!     tenant_id         UUID NOT NULL,
//!     workspace_id      UUID NOT NULL,
//!
//!     activity_count    BIGINT NOT NULL,
//!     success_count     BIGINT NOT NULL DEFAULT 0,
//!     error_count       BIGINT NOT NULL DEFAULT 0,
//!     total_emissions   DOUBLE PRECISION NOT NULL DEFAULT 0,
//!
//!     priority          SMALLINT NOT NULL DEFAULT 5,
//!     max_retries       INTEGER NOT NULL DEFAULT 3,
//!     retry_count       INTEGER NOT NULL DEFAULT 0,
//!
//!     status            TEXT NOT NULL DEFAULT 'pending',
//!     resume_cursor     BIGINT NOT NULL DEFAULT 0,
//!
//!     lease_holder      TEXT,
//!     lease_expires_at  TIMESTAMPTZ,
//!
//!     created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     started_at        TIMESTAMPTZ,
//!     completed_at      TIMESTAMPTZ,
//!
//!     idempotency_key   TEXT
//! );
//!
//! CREATE TABLE activity_refs (
//!     activity_id  UUID PRIMARY KEY,
//!     batch_id     UUID NOT NULL REFERENCES batches(id),
//!     sequence     BIGINT NOT NULL,
//!     metadata     JSONB
//! );
//!
//! CREATE TABLE progress_events (
//!     id        BIGSERIAL PRIMARY KEY,
//!     batch_id  UUID NOT NULL REFERENCES batches(id),
//!     kind      TEXT NOT NULL,
//!     at        TIMESTAMPTZ NOT NULL,
//!     payload   JSONB NOT NULL
//! );
//!
//! -- eligibility scans (spec §6 index (a))
//! CREATE INDEX idx_batches_eligibility ON batches (status, priority DESC, created_at ASC);
//! -- recovery sweeps over stale leases (spec §6 index (b))
//! CREATE INDEX idx_batches_lease ON batches (lease_holder, lease_expires_at);
//! -- activity lookups by batch (spec §6 index (c))
//! CREATE INDEX idx_activity_refs_batch_id ON activity_refs (batch_id);
//! -- enforces idempotent admission (spec §4.G): at most one batch per
//! -- (tenant, key) pair when a caller supplies one.
//! CREATE UNIQUE INDEX idx_batches_idempotency ON batches (tenant_id, idempotency_key)
//!     WHERE idempotency_key IS NOT NULL;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use batch_postgres::PgBatchStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/carbon").await?;
//! let store = PgBatchStore::new(pool);
//! ```

use async_trait::async_trait;
use batch_core::error::BatchStoreError;
use batch_core::model::{
    ActivityCursor, ActivityRef, Batch, BatchFilter, BatchId, BatchStatus, ProgressEvent,
};
use batch_core::store::{ActivityPage, BatchStore, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

/// `BatchStore` backed by a `sqlx::PgPool`. Every write that spans more than
/// one statement runs inside an explicit transaction so the CAS contracts in
/// `BatchStore`'s doc comments hold under concurrent schedulers, the same
/// discipline `seesaw-job-postgres::PgJobStore` applies to its `mark_failed`
/// path.
#[derive(Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_batch(row: &sqlx::postgres::PgRow) -> Result<Batch, BatchStoreError> {
    let status_str: String = row.try_get("status").map_err(permanent)?;
    let status = status_str
        .parse::<BatchStatus>()
        .map_err(|e| BatchStoreError::Permanent(anyhow::anyhow!(e)))?;
    let resume_cursor: i64 = row.try_get("resume_cursor").map_err(permanent)?;

    Ok(Batch {
        id: BatchId::from_uuid(row.try_get("id").map_err(permanent)?),
        tenant_id: row.try_get::<uuid::Uuid, _>("tenant_id").map_err(permanent)?.into(),
        workspace_id: row
            .try_get::<uuid::Uuid, _>("workspace_id")
            .map_err(permanent)?
            .into(),
        activity_count: row.try_get("activity_count").map_err(permanent)?,
        success_count: row.try_get("success_count").map_err(permanent)?,
        error_count: row.try_get("error_count").map_err(permanent)?,
        total_emissions: row.try_get("total_emissions").map_err(permanent)?,
        priority: row.try_get("priority").map_err(permanent)?,
        max_retries: row.try_get("max_retries").map_err(permanent)?,
        retry_count: row.try_get("retry_count").map_err(permanent)?,
        status,
        resume_cursor: ActivityCursor(resume_cursor),
        lease_holder: row.try_get("lease_holder").map_err(permanent)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(permanent)?,
        created_at: row.try_get("created_at").map_err(permanent)?,
        updated_at: row.try_get("updated_at").map_err(permanent)?,
        started_at: row.try_get("started_at").map_err(permanent)?,
        completed_at: row.try_get("completed_at").map_err(permanent)?,
        idempotency_key: row.try_get("idempotency_key").map_err(permanent)?,
    })
}

fn permanent(err: sqlx::Error) -> BatchStoreError {
    BatchStoreError::Permanent(err.into())
}

/// Postgres reports a transient condition (connection loss, serialization
/// failure, deadlock) distinctly from a query-shape bug; only the former
/// should be retried by the caller.
fn classify(err: sqlx::Error) -> BatchStoreError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            BatchStoreError::Transient(err.into())
        }
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) => {
            BatchStoreError::Transient(err.into())
        }
        _ => BatchStoreError::Permanent(err.into()),
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    #[instrument(skip(self, batch, activity_refs))]
    async fn insert(&self, batch: &Batch, activity_refs: &[ActivityRef]) -> StoreResult<BatchId> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        if let Some(key) = &batch.idempotency_key {
            let existing: Option<uuid::Uuid> = sqlx::query_scalar(
                "SELECT id FROM batches WHERE tenant_id = $1 AND idempotency_key = $2",
            )
            .bind(batch.tenant_id.0)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?;

            if let Some(id) = existing {
                return Ok(BatchId::from_uuid(id));
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO batches (
                id, tenant_id, workspace_id, activity_count, success_count,
                error_count, total_emissions, priority, max_retries, retry_count,
                status, resume_cursor, lease_holder, lease_expires_at,
                created_at, updated_at, started_at, completed_at, idempotency_key
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(batch.id.0)
        .bind(batch.tenant_id.0)
        .bind(batch.workspace_id.0)
        .bind(batch.activity_count)
        .bind(batch.success_count)
        .bind(batch.error_count)
        .bind(batch.total_emissions)
        .bind(batch.priority)
        .bind(batch.max_retries)
        .bind(batch.retry_count)
        .bind(batch.status.as_str())
        .bind(batch.resume_cursor.0)
        .bind(&batch.lease_holder)
        .bind(batch.lease_expires_at)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .bind(&batch.idempotency_key)
        .execute(&mut *tx)
        .await;

        let inserted = match inserted {
            Ok(result) => result,
            // A concurrent submission with the same idempotency key won the
            // race against the lookup above; fetch and return its id rather
            // than surfacing the constraint violation.
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                if let Some(key) = &batch.idempotency_key {
                    let id: uuid::Uuid = sqlx::query_scalar(
                        "SELECT id FROM batches WHERE tenant_id = $1 AND idempotency_key = $2",
                    )
                    .bind(batch.tenant_id.0)
                    .bind(key)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(classify)?;
                    tx.commit().await.map_err(classify)?;
                    return Ok(BatchId::from_uuid(id));
                }
                return Err(BatchStoreError::Conflict(batch.id));
            }
            Err(err) => return Err(classify(err)),
        };

        if inserted.rows_affected() == 0 {
            return Err(BatchStoreError::Conflict(batch.id));
        }

        for activity in activity_refs {
            sqlx::query(
                r#"
                INSERT INTO activity_refs (activity_id, batch_id, sequence, metadata)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(activity.activity_id.0)
            .bind(activity.batch_id.0)
            .bind(activity.sequence)
            .bind(&activity.metadata)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(batch.id)
    }

    #[instrument(skip(self))]
    async fn get(&self, batch_id: BatchId) -> StoreResult<Batch> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = $1")
            .bind(batch_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        row_to_batch(&row)
    }

    #[instrument(skip(self, filter))]
    async fn list(&self, filter: &BatchFilter, limit: i64, offset: i64) -> StoreResult<Vec<Batch>> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM batches WHERE 1 = 1");

        if let Some(tenant_id) = filter.tenant_id {
            qb.push(" AND tenant_id = ").push_bind(tenant_id.0);
        }
        if let Some(workspace_id) = filter.workspace_id {
            qb.push(" AND workspace_id = ").push_bind(workspace_id.0);
        }
        if let Some(statuses) = &filter.statuses {
            let strs: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
            qb.push(" AND status = ANY(").push_bind(strs).push(")");
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at > ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at < ").push_bind(before);
        }

        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(classify)?;
        rows.iter().map(row_to_batch).collect()
    }

    #[instrument(skip(self, expected_status))]
    async fn acquire_lease(
        &self,
        batch_id: BatchId,
        holder: &str,
        lease_duration: chrono::Duration,
        expected_status: &[BatchStatus],
    ) -> StoreResult<Batch> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let row = sqlx::query("SELECT * FROM batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        let current = row_to_batch(&row)?;

        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;

        if !expected_status.contains(&current.status) {
            return Err(BatchStoreError::LeaseConflict(batch_id));
        }
        let lease_free = match &current.lease_holder {
            None => true,
            Some(_) => current.lease_expires_at.map(|exp| now >= exp).unwrap_or(false),
        };
        if !lease_free {
            return Err(BatchStoreError::LeaseConflict(batch_id));
        }

        let new_status = if current.status == BatchStatus::Pending {
            BatchStatus::Queued
        } else {
            current.status
        };

        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET lease_holder = $1, lease_expires_at = $2, status = $3, updated_at = $4
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(holder)
        .bind(now + lease_duration)
        .bind(new_status.as_str())
        .bind(now)
        .bind(batch_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        row_to_batch(&updated)
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        batch_id: BatchId,
        holder: &str,
        lease_duration: chrono::Duration,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let row = sqlx::query("SELECT * FROM batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        let current = row_to_batch(&row)?;

        if current.lease_holder.as_deref() != Some(holder) {
            warn!(batch_id = %batch_id, "lease renewal found no matching holder");
            return Err(BatchStoreError::LeaseLost(batch_id));
        }
        // Re-read status on every renewal so a holder running in a
        // different process than whoever called `ControlApi::cancel` learns
        // of the cancellation on its next heartbeat.
        if current.status == BatchStatus::Cancelled {
            warn!(batch_id = %batch_id, "lease renewal observed cancellation");
            return Err(BatchStoreError::LeaseLost(batch_id));
        }

        sqlx::query(
            r#"
            UPDATE batches
            SET lease_expires_at = NOW() + $1::interval, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(chrono_duration_to_pg_interval(lease_duration))
        .bind(batch_id.0)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, batch_id: BatchId, holder: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE batches
            SET lease_holder = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lease_holder = $2
            "#,
        )
        .bind(batch_id.0)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[instrument(skip(self, require_from_status))]
    async fn update_status(
        &self,
        batch_id: BatchId,
        new_status: BatchStatus,
        require_holder: Option<&str>,
        require_from_status: Option<&[BatchStatus]>,
        reset_counters: bool,
    ) -> StoreResult<Batch> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let row = sqlx::query("SELECT * FROM batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        let current = row_to_batch(&row)?;

        if current.status.is_terminal() {
            return Err(BatchStoreError::Terminal(batch_id));
        }
        if let Some(holder) = require_holder {
            if current.lease_holder.as_deref() != Some(holder) {
                return Err(BatchStoreError::LeaseLost(batch_id));
            }
        }
        if let Some(allowed) = require_from_status {
            if !allowed.contains(&current.status) {
                return Err(BatchStoreError::LeaseConflict(batch_id));
            }
        }

        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await
            .map_err(classify)?;

        let clears_lease = new_status.is_terminal() || new_status == BatchStatus::Pending;
        let started_at = if new_status == BatchStatus::Processing && current.started_at.is_none() {
            Some(now)
        } else {
            current.started_at
        };
        let completed_at = if new_status.is_terminal() { Some(now) } else { None };
        let resets_counters_and_cursor = new_status == BatchStatus::Pending;

        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET status = $1,
                updated_at = $2,
                started_at = CASE
                    WHEN $7 THEN NULL
                    WHEN $3 IS NOT NULL THEN $3
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $7 THEN NULL
                    WHEN $4 THEN $5
                    ELSE completed_at
                END,
                lease_holder = CASE WHEN $6 THEN NULL ELSE lease_holder END,
                lease_expires_at = CASE WHEN $6 THEN NULL ELSE lease_expires_at END,
                retry_count = CASE WHEN $7 THEN retry_count + 1 ELSE retry_count END,
                resume_cursor = CASE WHEN $7 THEN 0 ELSE resume_cursor END,
                success_count = CASE WHEN $9 THEN 0 ELSE success_count END,
                error_count = CASE WHEN $9 THEN 0 ELSE error_count END,
                total_emissions = CASE WHEN $9 THEN 0 ELSE total_emissions END
            WHERE id = $8
            RETURNING *
            "#,
        )
        .bind(new_status.as_str())
        .bind(now)
        .bind(started_at)
        .bind(new_status.is_terminal())
        .bind(completed_at)
        .bind(clears_lease)
        .bind(resets_counters_and_cursor)
        .bind(batch_id.0)
        .bind(reset_counters)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        row_to_batch(&updated)
    }

    #[instrument(skip(self))]
    async fn increment_progress(
        &self,
        batch_id: BatchId,
        success_delta: i64,
        error_delta: i64,
        emissions_delta: f64,
        advance_to: Option<ActivityCursor>,
    ) -> StoreResult<Batch> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let row = sqlx::query("SELECT * FROM batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        let current = row_to_batch(&row)?;

        let new_success = (current.success_count + success_delta).max(0);
        let new_error = (current.error_count + error_delta).max(0);
        if new_success + new_error > current.activity_count {
            return Err(BatchStoreError::InvariantViolation {
                batch: batch_id,
                reason: format!(
                    "success({new_success}) + error({new_error}) > activity_count({})",
                    current.activity_count
                ),
            });
        }

        let next_cursor = advance_to.unwrap_or(current.resume_cursor);
        let updated = sqlx::query(
            r#"
            UPDATE batches
            SET resume_cursor = $1,
                success_count = $2,
                error_count = $3,
                total_emissions = GREATEST(total_emissions + $4, 0),
                updated_at = NOW()
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(next_cursor.0)
        .bind(new_success)
        .bind(new_error)
        .bind(emissions_delta)
        .bind(batch_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        row_to_batch(&updated)
    }

    #[instrument(skip(self))]
    async fn list_activity_refs(
        &self,
        batch_id: BatchId,
        cursor: ActivityCursor,
        limit: i64,
    ) -> StoreResult<ActivityPage> {
        let rows = sqlx::query(
            r#"
            SELECT activity_id, batch_id, sequence, metadata
            FROM activity_refs
            WHERE batch_id = $1 AND sequence >= $2
            ORDER BY sequence ASC
            LIMIT $3
            "#,
        )
        .bind(batch_id.0)
        .bind(cursor.0)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        let items: Vec<ActivityRef> = rows
            .iter()
            .take(limit.max(0) as usize)
            .map(|row| {
                Ok::<_, BatchStoreError>(ActivityRef {
                    activity_id: row.try_get::<uuid::Uuid, _>("activity_id").map_err(permanent)?.into(),
                    batch_id: row.try_get::<uuid::Uuid, _>("batch_id").map_err(permanent)?.into(),
                    sequence: row.try_get("sequence").map_err(permanent)?,
                    metadata: row.try_get("metadata").map_err(permanent)?,
                })
            })
            .collect::<Result<_, _>>()?;

        let next_cursor = rows
            .get(limit.max(0) as usize)
            .map(|row| row.try_get::<i64, _>("sequence"))
            .transpose()
            .map_err(permanent)?
            .map(ActivityCursor);

        Ok(ActivityPage { items, next_cursor })
    }

    #[instrument(skip(self, event))]
    async fn append_progress_event(&self, event: ProgressEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO progress_events (batch_id, kind, at, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.batch_id.0)
        .bind(event.kind.as_str())
        .bind(event.at)
        .bind(event.payload)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, batch_id: BatchId, force: bool) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(classify)?;

        let row = sqlx::query("SELECT status FROM batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify)?
            .ok_or(BatchStoreError::NotFound(batch_id))?;
        let status: String = row.try_get("status").map_err(permanent)?;
        let status: BatchStatus = status
            .parse()
            .map_err(|e| BatchStoreError::Permanent(anyhow::anyhow!(e)))?;

        if !force && !status.is_terminal() {
            return Err(BatchStoreError::Terminal(batch_id));
        }

        sqlx::query("DELETE FROM progress_events WHERE batch_id = $1")
            .bind(batch_id.0)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query("DELETE FROM activity_refs WHERE batch_id = $1")
            .bind(batch_id.0)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        sqlx::query("DELETE FROM batches WHERE id = $1")
            .bind(batch_id.0)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    /// Read-only candidate scan; no row locking is taken here. `acquire_lease`
    /// is the sole atomic CAS and remains correct under races even if two
    /// schedulers observe the same candidate — the loser simply gets
    /// `LeaseConflict`. Locking here would only shrink the (harmless) race
    /// window at the cost of holding row locks across a scheduler tick.
    #[instrument(skip(self))]
    async fn find_eligible(&self, now: DateTime<Utc>, max_count: i64) -> StoreResult<Vec<Batch>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM batches
            WHERE status IN ('pending', 'queued')
               OR (status = 'processing' AND lease_expires_at <= $1)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(max_count)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(row_to_batch).collect()
    }
}

fn chrono_duration_to_pg_interval(d: chrono::Duration) -> String {
    format!("{} seconds", d.num_seconds())
}
