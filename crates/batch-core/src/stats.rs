//! In-memory aggregation of counters, gauges, and rolling averages (spec
//! §4.F). The only source for the health/status surface; process-local,
//! never shared across scheduler replicas.
//!
//! All updates are non-blocking: monotonic counters are bare atomics, the
//! per-tenant gauge is a [`dashmap::DashMap`] (already a teacher dependency),
//! and the rolling average is an EWMA computed on every observation under a
//! short-lived lock, matching the "snapshots return a consistent view via a
//! single copy under a read lock" requirement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::model::TenantId;

/// Exponentially-weighted moving average decayed by wall-clock time elapsed
/// between observations, with a configurable half-life.
struct Ewma {
    half_life: Duration,
    value: Option<f64>,
    last_observed: Option<Instant>,
}

impl Ewma {
    fn new(half_life: Duration) -> Self {
        Self {
            half_life,
            value: None,
            last_observed: None,
        }
    }

    fn observe(&mut self, sample: f64) {
        let now = Instant::now();
        let alpha = match self.last_observed {
            None => 1.0,
            Some(last) if self.half_life.is_zero() => {
                let _ = last;
                1.0
            }
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                let half_life_secs = self.half_life.as_secs_f64();
                1.0 - 0.5f64.powf(elapsed / half_life_secs)
            }
        };
        self.last_observed = Some(now);
        self.value = Some(match self.value {
            Some(prev) => prev + alpha * (sample - prev),
            None => sample,
        });
    }

    fn get(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub batches_submitted: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub batches_cancelled: u64,
    pub activities_processed: u64,
    pub activities_succeeded: u64,
    pub activities_failed: u64,
    pub lease_acquisitions: u64,
    pub lease_conflicts: u64,
    pub lease_timeouts: u64,
    pub workers_active: u64,
    pub queue_depth: u64,
    pub avg_batch_duration_secs: Option<f64>,
}

pub struct StatsCollector {
    batches_submitted: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    batches_cancelled: AtomicU64,
    activities_processed: AtomicU64,
    activities_succeeded: AtomicU64,
    activities_failed: AtomicU64,
    lease_acquisitions: AtomicU64,
    lease_conflicts: AtomicU64,
    lease_timeouts: AtomicU64,
    workers_active: AtomicU64,
    queue_depth: AtomicU64,
    pending_per_tenant: DashMap<TenantId, u64>,
    duration_ewma: Mutex<Ewma>,
}

impl StatsCollector {
    pub fn new(duration_half_life: Duration) -> Self {
        Self {
            batches_submitted: AtomicU64::new(0),
            batches_completed: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_cancelled: AtomicU64::new(0),
            activities_processed: AtomicU64::new(0),
            activities_succeeded: AtomicU64::new(0),
            activities_failed: AtomicU64::new(0),
            lease_acquisitions: AtomicU64::new(0),
            lease_conflicts: AtomicU64::new(0),
            lease_timeouts: AtomicU64::new(0),
            workers_active: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            pending_per_tenant: DashMap::new(),
            duration_ewma: Mutex::new(Ewma::new(duration_half_life)),
        }
    }

    pub fn record_submitted(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration_secs: f64) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut ewma) = self.duration_ewma.lock() {
            ewma.observe(duration_secs);
        }
    }

    pub fn record_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.batches_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity(&self, succeeded: bool) {
        self.activities_processed.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.activities_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.activities_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lease_acquired(&self) {
        self.lease_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_conflict(&self) {
        self.lease_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_timeout(&self) {
        self.lease_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_workers_active(&self, count: u64) {
        self.workers_active.store(count, Ordering::Relaxed);
    }

    pub fn observe_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn sample_pending_for_tenant(&self, tenant: TenantId, count: u64) {
        self.pending_per_tenant.insert(tenant, count);
    }

    pub fn pending_for_tenant(&self, tenant: TenantId) -> u64 {
        self.pending_per_tenant.get(&tenant).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let avg_batch_duration_secs = self.duration_ewma.lock().ok().and_then(|e| e.get());
        StatsSnapshot {
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_cancelled: self.batches_cancelled.load(Ordering::Relaxed),
            activities_processed: self.activities_processed.load(Ordering::Relaxed),
            activities_succeeded: self.activities_succeeded.load(Ordering::Relaxed),
            activities_failed: self.activities_failed.load(Ordering::Relaxed),
            lease_acquisitions: self.lease_acquisitions.load(Ordering::Relaxed),
            lease_conflicts: self.lease_conflicts.load(Ordering::Relaxed),
            lease_timeouts: self.lease_timeouts.load(Ordering::Relaxed),
            workers_active: self.workers_active.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            avg_batch_duration_secs,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DURATION_EWMA_HALF_LIFE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let stats = StatsCollector::default();
        stats.record_submitted();
        stats.record_completed(12.5);
        stats.record_activity(true);
        stats.record_activity(false);
        stats.record_lease_conflict();

        let snap = stats.snapshot();
        assert_eq!(snap.batches_submitted, 1);
        assert_eq!(snap.batches_completed, 1);
        assert_eq!(snap.activities_processed, 2);
        assert_eq!(snap.activities_succeeded, 1);
        assert_eq!(snap.activities_failed, 1);
        assert_eq!(snap.lease_conflicts, 1);
        assert_eq!(snap.avg_batch_duration_secs, Some(12.5));
    }

    #[test]
    fn pending_per_tenant_is_sampled_independently() {
        let stats = StatsCollector::default();
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        stats.sample_pending_for_tenant(t1, 3);
        stats.sample_pending_for_tenant(t2, 7);
        assert_eq!(stats.pending_for_tenant(t1), 3);
        assert_eq!(stats.pending_for_tenant(t2), 7);
    }
}
