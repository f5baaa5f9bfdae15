//! Domain model: batches, activity references, and progress events.
//!
//! These types are storage-agnostic — `batch-postgres` and `batch-memory`
//! both speak this vocabulary through the [`crate::store::BatchStore`] trait.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_newtype!(BatchId);
uuid_newtype!(TenantId);
uuid_newtype!(WorkspaceId);
uuid_newtype!(ActivityId);

/// Lifecycle status of a [`Batch`]. See spec §3 for the full state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Queued,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl BatchStatus {
    /// Terminal statuses are absorbing: any mutation other than delete must fail.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ModelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(ModelParseError::UnknownBatchStatus(other.to_string())),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelParseError {
    #[error("unknown batch status: {0}")]
    UnknownBatchStatus(String),
}

/// A user-submitted collection of activities processed as one logical job.
///
/// See spec §3 for the full invariant list:
/// - `success_count + error_count <= activity_count` always.
/// - `lease_holder` and `lease_expires_at` are either both `None` or both `Some`.
/// - `retry_count <= max_retries`.
/// - terminal statuses are absorbing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub workspace_id: WorkspaceId,

    pub activity_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_emissions: f64,

    pub priority: i16,
    pub max_retries: i32,
    pub retry_count: i32,

    pub status: BatchStatus,

    /// Where the next `list_activity_refs` scan should resume. Advanced by
    /// [`crate::store::BatchStore::increment_progress`] one activity at a
    /// time, so a re-leased batch (spec §8 scenario 4) restarts from the
    /// first unacknowledged activity rather than the beginning.
    pub resume_cursor: ActivityCursor,

    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub idempotency_key: Option<String>,
}

impl Batch {
    /// A batch is eligible for dispatch iff `status in {Pending, Queued}` or
    /// `status = Processing` and its lease has expired by `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            BatchStatus::Pending | BatchStatus::Queued => true,
            BatchStatus::Processing => self
                .lease_expires_at
                .map(|expires| now >= expires)
                .unwrap_or(false),
            BatchStatus::Complete | BatchStatus::Failed | BatchStatus::Cancelled => false,
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.activity_count == 0 {
            return 1.0;
        }
        (self.success_count + self.error_count) as f64 / self.activity_count as f64
    }
}

/// Reference to a single activity belonging to a [`Batch`].
///
/// Carries an opaque, caller-defined metadata payload the core never
/// interprets; it is handed to the external [`crate::processor::ActivityProcessor`]
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRef {
    pub activity_id: ActivityId,
    pub batch_id: BatchId,
    pub sequence: i64,
    pub metadata: Option<serde_json::Value>,
}

/// Opaque, stable pagination cursor for [`crate::store::BatchStore::list_activity_refs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCursor(pub i64);

impl ActivityCursor {
    pub const START: ActivityCursor = ActivityCursor(0);
}

/// Append-only audit entry recording an observable batch transition or
/// periodic progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub batch_id: BatchId,
    pub kind: ProgressEventKind,
    pub at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressEventKind {
    Submitted,
    Processing,
    Snapshot,
    Complete,
    Failed,
    Cancelled,
}

impl ProgressEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Snapshot => "snapshot",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Filter criteria for [`crate::store::BatchStore::list`].
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    pub tenant_id: Option<TenantId>,
    pub workspace_id: Option<WorkspaceId>,
    pub statuses: Option<Vec<BatchStatus>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_follows_spec_invariant() {
        let now = Utc::now();
        let base = Batch {
            id: BatchId::new(),
            tenant_id: TenantId::new(),
            workspace_id: WorkspaceId::new(),
            activity_count: 10,
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

        assert!(base.is_eligible(now));

        let mut queued = base.clone();
        queued.status = BatchStatus::Queued;
        assert!(queued.is_eligible(now));

        let mut processing_live = base.clone();
        processing_live.status = BatchStatus::Processing;
        processing_live.lease_holder = Some("worker-1".into());
        processing_live.lease_expires_at = Some(now + chrono::Duration::minutes(5));
        assert!(!processing_live.is_eligible(now));

        let mut processing_expired = processing_live.clone();
        processing_expired.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(processing_expired.is_eligible(now));

        // Greater-than-or-equal on eligibility: exactly-now expiry already counts as expired.
        let mut processing_exact = processing_live.clone();
        processing_exact.lease_expires_at = Some(now);
        assert!(processing_exact.is_eligible(now));

        let mut terminal = base.clone();
        terminal.status = BatchStatus::Complete;
        assert!(!terminal.is_eligible(now));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Queued,
            BatchStatus::Processing,
            BatchStatus::Complete,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ] {
            let s = status.to_string();
            assert_eq!(s.parse::<BatchStatus>().unwrap(), status);
        }
    }
}
