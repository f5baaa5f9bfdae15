//! Every knob enumerated in spec §6, collected into one `Default`-able
//! struct. The core is a library, not a standalone service, so configuration
//! is a plain struct constructed by the embedding application rather than a
//! file/env-loading framework.

use std::time::Duration;

/// How `ControlApi::retry` treats `success_count`/`error_count`/`total_emissions`.
///
/// Spec §9 leaves this an open question and asks implementers to make it
/// configurable; see `DESIGN.md` for the default rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCounterPolicy {
    /// Reset counters to zero, symmetric with `Pending` meaning "not yet
    /// started". The spec's stated default.
    Reset,
    /// Preserve counters accrued by the failed/cancelled attempt.
    Preserve,
}

impl Default for RetryCounterPolicy {
    fn default() -> Self {
        Self::Reset
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Main polling loop cadence.
    pub polling_interval: Duration,
    /// Uniform random jitter applied to each sleep, to avoid herding across
    /// scheduler replicas.
    pub jitter_range: Duration,
    /// Upper bound on per-tick dispatch.
    pub max_batches_per_poll: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            jitter_range: Duration::from_secs(5),
            max_batches_per_poll: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerConfig {
    /// Lock lifetime; renewal interval is `lease_ttl / 3`.
    pub lease_ttl: Duration,
    /// Default per-batch retry budget applied at submission time.
    pub max_retries: i32,
    /// Emit a progress event every N activities...
    pub progress_flush_n: u32,
    /// ...or every T seconds, whichever comes first.
    pub progress_flush_t: Duration,
    pub retry_counter_policy: RetryCounterPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            max_retries: 3,
            progress_flush_n: 50,
            progress_flush_t: Duration::from_secs(5),
            retry_counter_policy: RetryCounterPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    pub worker_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    pub max_activities_per_batch: i64,
    pub default_priority: i16,
    pub default_max_retries: i32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_activities_per_batch: 100_000,
            default_priority: 5,
            default_max_retries: 3,
        }
    }
}

/// Aggregate configuration for one embedded batch-core instance.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BatchCoreConfig {
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
    pub admission: AdmissionConfig,
}

/// Rolling-average half-life for [`crate::stats::StatsCollector`]'s EWMA.
pub const DEFAULT_DURATION_EWMA_HALF_LIFE: Duration = Duration::from_secs(5 * 60);
