//! Owns the polling loop and the lifecycle of the whole core (spec §4.E).
//!
//! One logical task per `Scheduler` instance: sleep with jitter, discover
//! eligible batches, race to lease them, hand winners to the pool. Multiple
//! `Scheduler`s may run concurrently across processes; correctness rests
//! entirely on [`crate::lease::LeaseManager`] / [`crate::store::BatchStore`]
//! CAS semantics, never on anything this struct holds in memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::error::BatchStoreError;
use crate::lease::LeaseManager;
use crate::model::BatchStatus;
use crate::pool::WorkerPool;
use crate::processor::ActivityProcessor;
use crate::stats::StatsCollector;
use crate::store::BatchStore;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
}

const ACQUIRABLE_STATUSES: [BatchStatus; 3] = [
    BatchStatus::Pending,
    BatchStatus::Queued,
    BatchStatus::Processing,
];

pub struct Scheduler<S, P> {
    store: Arc<S>,
    pool: Arc<WorkerPool<S, P>>,
    lease: Arc<LeaseManager>,
    stats: Arc<StatsCollector>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S, P> Scheduler<S, P>
where
    S: BatchStore + 'static,
    P: ActivityProcessor + 'static,
{
    pub fn new(
        store: Arc<S>,
        pool: Arc<WorkerPool<S, P>>,
        lease: Arc<LeaseManager>,
        stats: Arc<StatsCollector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pool,
            lease,
            stats,
            config,
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Launches the polling loop. Idempotent in the sense that it errors
    /// rather than double-spawning if already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut guard = self.loop_handle.lock().await;
        if guard.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let this = self.clone();
        *guard = Some(tokio::spawn(async move { this.run_loop().await }));
        Ok(())
    }

    /// Sets a shutdown flag, stops the loop, then drains the pool. Bounds
    /// its wait by `deadline`; on timeout it returns without forcing
    /// workers, so leases simply expire and recovery occurs on the next
    /// process's polling (spec §4.E).
    pub async fn stop(&self, deadline: Option<Duration>) {
        self.cancel.cancel();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let wait = async { let _ = handle.await; };
            match deadline {
                Some(d) => {
                    if tokio::time::timeout(d, wait).await.is_err() {
                        warn!("scheduler loop did not stop within deadline");
                    }
                }
                None => wait.await,
            }
        }

        self.pool.drain(deadline).await;
        info!("scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let sleep = jittered_sleep(self.config.polling_interval, self.config.jitter_range);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("scheduler loop cancelled");
                    return;
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            if self.cancel.is_cancelled() {
                return;
            }

            if let Err(err) = self.poll_once().await {
                warn!(error = %err, "poll tick failed; continuing on next tick");
            }
        }
    }

    #[instrument(skip(self))]
    async fn poll_once(&self) -> Result<(), BatchStoreError> {
        let free = self.pool.free_capacity();
        if free == 0 {
            return Ok(());
        }

        let want = free.min(self.config.max_batches_per_poll);
        let now = chrono::Utc::now();
        let candidates = self.store.find_eligible(now, want as i64).await?;
        self.stats.observe_queue_depth(candidates.len());

        for batch in candidates {
            match self.lease.acquire(batch.id, &ACQUIRABLE_STATUSES).await {
                Ok(_leased) => {
                    self.stats.record_lease_acquired();
                    if !self.pool.submit(batch.id).await {
                        // Lost the capacity race between the check above and
                        // submit; release immediately so another tick (or
                        // another scheduler) can pick it back up.
                        let _ = self.lease.release(batch.id).await;
                        self.stats.record_lease_conflict();
                    }
                }
                Err(BatchStoreError::LeaseConflict(_)) => {
                    self.stats.record_lease_conflict();
                }
                Err(err) => {
                    warn!(batch_id = %batch.id, error = %err, "failed to acquire lease");
                }
            }
        }

        Ok(())
    }
}

fn jittered_sleep(interval: Duration, jitter_range: Duration) -> Duration {
    let jitter_ms = jitter_range.as_millis() as i64;
    if jitter_ms == 0 {
        return interval;
    }
    let delta_ms = fastrand::i64(-jitter_ms..=jitter_ms);
    let total_ms = (interval.as_millis() as i64 + delta_ms).max(0);
    Duration::from_millis(total_ms as u64)
}
