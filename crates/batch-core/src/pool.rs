//! Bounded concurrency primitive dispatching leased batches to idle workers
//! (spec §4.D).
//!
//! Sizing is a [`tokio::sync::Semaphore`], the same concurrency-ceiling idiom
//! the pack's `fc-router::ProcessPool` uses, simplified: this core has no
//! per-group FIFO ordering requirement (spec §5: "across batches, no
//! ordering guarantee"), so a flat semaphore plus a `JoinSet` of in-flight
//! tasks is sufficient.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::control::CancellationRegistry;
use crate::lease::LeaseManager;
use crate::model::BatchId;
use crate::processor::ActivityProcessor;
use crate::sink::ProgressEventSink;
use crate::stats::StatsCollector;
use crate::store::BatchStore;
use crate::worker::{Worker, WorkerOutcome};

/// Bounded pool of size `worker_pool_size` (spec default 5).
pub struct WorkerPool<S, P> {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<WorkerOutcome>>,
    /// Shared with the embedding application's `ControlApi` so
    /// `ControlApi::cancel` can signal an in-process worker directly instead
    /// of waiting for its next lease renewal (spec §4.C/§4.H).
    cancellation: CancellationRegistry,

    store: Arc<S>,
    processor: Arc<P>,
    lease: Arc<LeaseManager>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ProgressEventSink>,
    stats: Arc<StatsCollector>,
    worker_config: WorkerConfig,
}

impl<S, P> WorkerPool<S, P>
where
    S: BatchStore + 'static,
    P: ActivityProcessor + 'static,
{
    pub fn new(
        capacity: usize,
        store: Arc<S>,
        processor: Arc<P>,
        lease: Arc<LeaseManager>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ProgressEventSink>,
        stats: Arc<StatsCollector>,
        cancellation: CancellationRegistry,
        worker_config: WorkerConfig,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
            cancellation,
            store,
            processor,
            lease,
            clock,
            sink,
            stats,
            worker_config,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.active_count())
    }

    /// Non-blocking. Returns `false` when the pool is full or draining,
    /// allowing the scheduler to defer dispatch; the caller owns releasing
    /// the lease in that case (spec §4.E step 4).
    pub async fn submit(&self, batch_id: BatchId) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let worker = Worker::new(
            self.store.clone(),
            self.processor.clone(),
            self.lease.clone(),
            self.clock.clone(),
            self.sink.clone(),
            self.stats.clone(),
            self.worker_config,
        );
        let active = self.active.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.child_token();
        self.cancellation.register(batch_id, cancel.clone());

        let now_active = active.fetch_add(1, Ordering::Relaxed) + 1;
        stats.set_workers_active(now_active as u64);
        let mut tasks = self.tasks.lock().await;
        let cancellation = self.cancellation.clone();
        tasks.spawn(async move {
            let outcome = worker.run(batch_id, cancel).await;
            cancellation.unregister(batch_id);
            let now_active = active.fetch_sub(1, Ordering::Relaxed) - 1;
            stats.set_workers_active(now_active as u64);
            let _permit = permit; // held until the task completes
            outcome
        });
        debug!(batch_id = %batch_id, "submitted batch to worker pool");
        true
    }

    /// Refuses new submissions and waits for all in-flight workers to
    /// finish, respecting `deadline`. After `drain` returns, every in-flight
    /// batch has either reached a terminal state or had its lease released
    /// (spec §4.D).
    pub async fn drain(&self, deadline: Option<Duration>) {
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        let wait_all = async {
            while tasks.join_next().await.is_some() {}
        };

        match deadline {
            Some(d) => {
                if tokio::time::timeout(d, wait_all).await.is_err() {
                    warn!("drain deadline exceeded; leaving remaining workers to finish or leases to expire");
                }
            }
            None => wait_all.await,
        }
    }
}
