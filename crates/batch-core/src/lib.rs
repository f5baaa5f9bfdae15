//! # batch-core
//!
//! The durable batch-processing core of a multi-tenant carbon-accounting
//! platform: admission, leased dispatch across a worker pool, a per-batch
//! state machine with retry and cancellation semantics, and observable
//! progress and aggregate metrics.
//!
//! ## Architecture
//!
//! ```text
//! SubmissionApi ──insert──► BatchStore ◄──find_eligible── Scheduler
//!                                ▲                             │
//!                                │                        acquire_lease
//!                        update_status/                        │
//!                     increment_progress                        ▼
//!                                │                        WorkerPool
//!                                │                             │
//!                                └──────────── Worker ◄────────┘
//!                                               │
//!                                      ActivityProcessor (external)
//!
//! ControlApi ──update_status/delete──► BatchStore
//! StatsCollector ◄── observes acquisition/completion events
//! ```
//!
//! ## Core principle
//!
//! The [`BatchStore`] is the only shared state across scheduler replicas.
//! Every mutation is a compare-and-swap on `(status, lease_holder)`; no
//! in-memory lock ever spans a store call. This mirrors the teacher crate's
//! own design: one storage trait with explicit method contracts, multiple
//! interchangeable backends, and coordination pushed entirely into that
//! trait's atomicity guarantees rather than into shared mutable state.
//!
//! ## What this crate is not
//!
//! - Not an HTTP or GraphQL layer — `SubmissionApi`/`ControlApi` are plain
//!   async method calls for an embedding request layer to wrap.
//! - Not an emissions calculator — `ActivityProcessor` is supplied by the
//!   caller.
//! - Not a migration tool — `batch-postgres` documents the schema it expects
//!   but does not run migrations.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use batch_core::prelude::*;
//!
//! let store: Arc<dyn BatchStore> = Arc::new(my_store);
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let ids: Arc<dyn IdGenerator> = Arc::new(UuidGenerator);
//! let sink: Arc<dyn ProgressEventSink> = Arc::new(NoOpEventSink);
//! let stats = Arc::new(StatsCollector::default());
//!
//! let submission = SubmissionApi::new(store.clone(), clock, ids, sink.clone(), stats.clone(), AdmissionConfig::default());
//! let batch_id = submission
//!     .submit_batch(tenant_id, workspace_id, activities, SubmitOptions::default())
//!     .await?;
//! ```

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod idgen;
pub mod lease;
pub mod model;
pub mod pool;
pub mod processor;
pub mod scheduler;
pub mod sink;
pub mod stats;
pub mod store;
pub mod submission;
pub mod worker;

pub use async_trait::async_trait;

/// Everything a typical embedder needs in one `use`.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::{
        AdmissionConfig, BatchCoreConfig, PoolConfig, RetryCounterPolicy, SchedulerConfig,
        WorkerConfig,
    };
    pub use crate::control::{CancellationRegistry, ControlApi, ProgressSnapshot};
    pub use crate::error::{
        BatchStoreError, Categorizable, ControlError, ProcessorError, SubmissionError,
    };
    pub use crate::idgen::{IdGenerator, UuidGenerator};
    pub use crate::lease::LeaseManager;
    pub use crate::model::{
        ActivityCursor, ActivityId, ActivityRef, Batch, BatchFilter, BatchId, BatchStatus,
        ProgressEvent, ProgressEventKind, TenantId, WorkspaceId,
    };
    pub use crate::pool::WorkerPool;
    pub use crate::processor::{ActivityProcessor, EmissionsDelta};
    pub use crate::scheduler::{Scheduler, SchedulerError};
    pub use crate::sink::{NoOpEventSink, ProgressEventSink};
    pub use crate::stats::{StatsCollector, StatsSnapshot};
    pub use crate::store::{ActivityPage, BatchStore, StoreResult};
    pub use crate::submission::{NewActivity, SubmissionApi, SubmitOptions};
    pub use crate::worker::{Worker, WorkerOutcome};
}
