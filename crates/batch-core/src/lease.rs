//! Thin protocol layer over [`BatchStore`]: acquisition, renewal discipline,
//! and release of per-batch leases (spec §4.B).
//!
//! Holder identity is a process-stable [`Uuid`] generated once per
//! `LeaseManager`, standing in for "the scheduler instance ID" spec §4.B
//! requires. All timestamps are read/written through the store's own clock
//! (never the caller's), eliminating skew between scheduler replicas.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BatchStoreError;
use crate::model::{Batch, BatchId, BatchStatus};
use crate::store::{BatchStore, StoreResult};

/// Per-process lease holder identity and the TTL it acquires with.
pub struct LeaseManager {
    store: Arc<dyn BatchStore>,
    holder_id: String,
    lease_ttl: StdDuration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn BatchStore>, lease_ttl: StdDuration) -> Self {
        Self {
            store,
            holder_id: Uuid::new_v4().to_string(),
            lease_ttl,
        }
    }

    /// Construct with an explicit holder id (tests, or multi-scheduler
    /// simulations that want deterministic identities).
    pub fn with_holder_id(store: Arc<dyn BatchStore>, holder_id: String, lease_ttl: StdDuration) -> Self {
        Self {
            store,
            holder_id,
            lease_ttl,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_ttl(&self) -> StdDuration {
        self.lease_ttl
    }

    /// The renewal cadence a worker holding this lease must honor:
    /// `lease_ttl / 3` (spec §4.B).
    pub fn renewal_interval(&self) -> StdDuration {
        self.lease_ttl / 3
    }

    /// Attempts to acquire a lease on `batch_id`. A [`BatchStoreError::LeaseConflict`]
    /// means another scheduler won the race and should be logged at debug
    /// and skipped, per spec §4.E step 3.
    pub async fn acquire(
        &self,
        batch_id: BatchId,
        expected_status: &[BatchStatus],
    ) -> StoreResult<Batch> {
        let duration = to_chrono_duration(self.lease_ttl);
        match self
            .store
            .acquire_lease(batch_id, &self.holder_id, duration, expected_status)
            .await
        {
            Ok(batch) => Ok(batch),
            Err(BatchStoreError::LeaseConflict(id)) => {
                debug!(batch_id = %id, "lease conflict, another holder won the race");
                Err(BatchStoreError::LeaseConflict(id))
            }
            Err(other) => Err(other),
        }
    }

    /// Extends the lease. A [`BatchStoreError::LeaseLost`] is fatal to the
    /// caller's current batch: it must abandon in-memory state and stop
    /// writing (spec §4.B).
    pub async fn renew(&self, batch_id: BatchId) -> StoreResult<()> {
        let duration = to_chrono_duration(self.lease_ttl);
        match self.store.renew_lease(batch_id, &self.holder_id, duration).await {
            Ok(()) => Ok(()),
            Err(BatchStoreError::LeaseLost(id)) => {
                warn!(batch_id = %id, "lease lost during renewal");
                Err(BatchStoreError::LeaseLost(id))
            }
            Err(other) => Err(other),
        }
    }

    /// Idempotent: never fails when the lease is already released.
    pub async fn release(&self, batch_id: BatchId) -> StoreResult<()> {
        self.store.release_lease(batch_id, &self.holder_id).await
    }
}

fn to_chrono_duration(d: StdDuration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(0))
}
