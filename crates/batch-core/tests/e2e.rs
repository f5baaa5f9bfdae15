//! Concrete end-to-end scenarios from spec §8, driven directly against
//! `InMemoryBatchStore` with scripted processors from `batch-testing`.

use std::sync::Arc;
use std::time::Duration;

use batch_core::clock::SystemClock;
use batch_core::config::WorkerConfig;
use batch_core::control::{CancellationRegistry, ControlApi};
use batch_core::lease::LeaseManager;
use batch_core::model::{ActivityCursor, BatchStatus};
use batch_core::pool::WorkerPool;
use batch_core::sink::NoOpEventSink;
use batch_core::stats::StatsCollector;
use batch_core::store::BatchStore;
use batch_core::worker::{Worker, WorkerOutcome};
use batch_memory::InMemoryBatchStore;
use batch_testing::fixtures::sample_batch_with_activities;
use batch_testing::{CrashingProcessor, ScriptedOutcome, ScriptedProcessor};
use tokio_util::sync::CancellationToken;

const ACQUIRABLE: [BatchStatus; 3] = [
    BatchStatus::Pending,
    BatchStatus::Queued,
    BatchStatus::Processing,
];

fn make_worker<P: batch_core::processor::ActivityProcessor + 'static>(
    store: Arc<InMemoryBatchStore>,
    processor: Arc<P>,
    lease: Arc<LeaseManager>,
) -> Worker<InMemoryBatchStore, P> {
    Worker::new(
        store,
        processor,
        lease,
        Arc::new(SystemClock),
        Arc::new(NoOpEventSink),
        Arc::new(StatsCollector::default()),
        WorkerConfig::default(),
    )
}

#[tokio::test]
async fn scenario_1_happy_path() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(3);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let processor = Arc::new(
        ScriptedProcessor::new(0.0)
            .with_outcome(0, ScriptedOutcome::Success(1.0))
            .with_outcome(1, ScriptedOutcome::Success(2.5))
            .with_outcome(2, ScriptedOutcome::Success(0.5)),
    );
    let worker = make_worker(store.clone(), processor, lease.clone());

    let outcome = worker.run(batch.id, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::Complete);

    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Complete);
    assert_eq!(finished.success_count, 3);
    assert_eq!(finished.error_count, 0);
    assert!((finished.total_emissions - 4.0).abs() < 1e-9);
    assert!(finished.lease_holder.is_none());
}

#[tokio::test]
async fn scenario_2_partial_errors_still_completes() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(4);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let processor = Arc::new(
        ScriptedProcessor::new(1.0).with_outcome(1, ScriptedOutcome::Retryable),
    );
    let worker = make_worker(store.clone(), processor, lease);

    let outcome = worker.run(batch.id, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::Complete);

    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Complete);
    assert_eq!(finished.success_count, 3);
    assert_eq!(finished.error_count, 1);
}

#[tokio::test]
async fn scenario_3_terminal_failure_aborts_batch() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(5);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let processor = Arc::new(ScriptedProcessor::new(1.0).with_outcome(2, ScriptedOutcome::Terminal));
    let worker = make_worker(store.clone(), processor, lease);

    let outcome = worker.run(batch.id, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::Failed);

    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Failed);
    assert_eq!(finished.success_count, 2);
    assert_eq!(finished.error_count, 0);
    assert!(finished.lease_holder.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_4_crash_and_recovery() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(10);
    store.insert(&batch, &refs).await.unwrap();

    let lease_a = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease_a.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let crashing = Arc::new(CrashingProcessor::new(4));
    let worker_a = make_worker(store.clone(), crashing.clone(), lease_a.clone());

    let token = CancellationToken::new();
    let handle = tokio::spawn({
        let token = token.clone();
        async move { worker_a.run(batch.id, token).await }
    });

    crashing.wait_for_crash_point().await;
    handle.abort(); // simulate the worker process dying: no cleanup runs

    let mid = store.get(batch.id).await.unwrap();
    assert_eq!(mid.status, BatchStatus::Processing);
    assert_eq!(mid.success_count, 4);

    // Force the stale lease to expire instead of waiting out LeaseTTL.
    store
        .renew_lease(batch.id, lease_a.holder_id(), chrono::Duration::seconds(-1))
        .await
        .unwrap();

    let eligible = store.find_eligible(chrono::Utc::now(), 10).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].id, batch.id);

    let lease_b = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease_b.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let resumed_processor = Arc::new(ScriptedProcessor::always_succeeds(1.0));
    let worker_b = make_worker(store.clone(), resumed_processor, lease_b);
    let outcome = worker_b.run(batch.id, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::Complete);

    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Complete);
    // worker_a's first 4 activities already advanced the persisted resume
    // cursor; worker_b picks up from there and the two runs together cover
    // all 10 without double-counting.
    assert_eq!(finished.success_count, 10);
}

#[tokio::test]
async fn scenario_5_cancellation_mid_flight() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(100);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let mut worker_config = WorkerConfig::default();
    worker_config.progress_flush_n = 1;
    let worker = Worker::new(
        store.clone(),
        Arc::new(ScriptedProcessor::always_succeeds(1.0)),
        lease.clone(),
        Arc::new(SystemClock),
        Arc::new(NoOpEventSink),
        Arc::new(StatsCollector::default()),
        worker_config,
    );

    let cancellation = CancellationRegistry::new();
    let token = CancellationToken::new();
    cancellation.register(batch.id, token.clone());

    let handle = tokio::spawn({
        let store = store.clone();
        let token = token.clone();
        async move {
            // Cancel shortly after the batch has made some progress.
            loop {
                if store.get(batch.id).await.unwrap().success_count >= 10 {
                    token.cancel();
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
    });

    let outcome = worker.run(batch.id, token).await;
    handle.await.unwrap();

    assert_eq!(outcome, WorkerOutcome::Cancelled);

    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Cancelled);
    assert!(finished.success_count <= 100);
    assert!(finished.lease_holder.is_none());

    let control = ControlApi::new(
        store.clone(),
        cancellation,
        batch_core::config::RetryCounterPolicy::Reset,
        0.1,
    );
    let progress = control.get_progress(batch.id).await.unwrap();
    assert!(progress.percent_complete > 0.0);
}

#[tokio::test]
async fn scenario_6_retry_exhaustion() {
    let store: Arc<InMemoryBatchStore> = Arc::new(InMemoryBatchStore::new());
    let (mut batch, refs) = sample_batch_with_activities(3);
    batch.max_retries = 1;
    store.insert(&batch, &refs).await.unwrap();

    let cancellation = CancellationRegistry::new();
    let control = ControlApi::new(
        store.clone(),
        cancellation,
        batch_core::config::RetryCounterPolicy::Reset,
        0.1,
    );

    // First failed run.
    let lease1 = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease1.acquire(batch.id, &ACQUIRABLE).await.unwrap();
    let processor = Arc::new(ScriptedProcessor::new(1.0).with_outcome(0, ScriptedOutcome::Terminal));
    let worker1 = make_worker(store.clone(), processor, lease1);
    assert_eq!(
        worker1.run(batch.id, CancellationToken::new()).await,
        WorkerOutcome::Failed
    );

    // First retry succeeds in resetting to Pending.
    control.retry(batch.id).await.unwrap();
    let after_retry = store.get(batch.id).await.unwrap();
    assert_eq!(after_retry.status, BatchStatus::Pending);
    assert_eq!(after_retry.retry_count, 1);
    assert_eq!(after_retry.success_count, 0);
    assert_eq!(after_retry.activity_count, 3);

    // Second failed run.
    let lease2 = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease2.acquire(batch.id, &ACQUIRABLE).await.unwrap();
    let processor2 = Arc::new(ScriptedProcessor::new(1.0).with_outcome(0, ScriptedOutcome::Terminal));
    let worker2 = make_worker(store.clone(), processor2, lease2);
    assert_eq!(
        worker2.run(batch.id, CancellationToken::new()).await,
        WorkerOutcome::Failed
    );

    // Second retry is exhausted: max_retries is 1, retry_count is already 1.
    let err = control.retry(batch.id).await.unwrap_err();
    assert!(matches!(
        err,
        batch_core::error::ControlError::RetryExhausted(_)
    ));

    let still_failed = store.get(batch.id).await.unwrap();
    assert_eq!(still_failed.status, BatchStatus::Failed);
}

#[tokio::test]
async fn submit_cancel_retry_round_trip_restores_pending() {
    let store: Arc<InMemoryBatchStore> = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(2);
    store.insert(&batch, &refs).await.unwrap();

    let cancellation = CancellationRegistry::new();
    let control = ControlApi::new(
        store.clone(),
        cancellation,
        batch_core::config::RetryCounterPolicy::Reset,
        0.1,
    );

    control.cancel(batch.id).await.unwrap();
    let cancelled = store.get(batch.id).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);

    control.retry(batch.id).await.unwrap();
    let retried = store.get(batch.id).await.unwrap();
    assert_eq!(retried.status, BatchStatus::Pending);
    assert_eq!(retried.activity_count, 2);
}

#[tokio::test]
async fn boundary_single_activity_batch_completes() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(1);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();
    let worker = make_worker(
        store.clone(),
        Arc::new(ScriptedProcessor::always_succeeds(1.0)),
        lease,
    );

    let outcome = worker.run(batch.id, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::Complete);
    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.success_count, 1);
}

#[tokio::test]
async fn worker_reports_activity_and_completion_stats() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(4);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();

    let processor = Arc::new(
        ScriptedProcessor::new(1.0).with_outcome(1, ScriptedOutcome::Retryable),
    );
    let stats = Arc::new(StatsCollector::default());
    let worker = Worker::new(
        store.clone(),
        processor,
        lease,
        Arc::new(SystemClock),
        Arc::new(NoOpEventSink),
        stats.clone(),
        WorkerConfig::default(),
    );

    let outcome = worker.run(batch.id, CancellationToken::new()).await;
    assert_eq!(outcome, WorkerOutcome::Complete);

    let snap = stats.snapshot();
    assert_eq!(snap.activities_processed, 4);
    assert_eq!(snap.activities_succeeded, 3);
    assert_eq!(snap.activities_failed, 1);
    assert_eq!(snap.batches_completed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn control_api_cancel_signals_worker_dispatched_through_pool() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(200);
    store.insert(&batch, &refs).await.unwrap();

    let lease = Arc::new(LeaseManager::new(store.clone(), Duration::from_secs(300)));
    let cancellation = CancellationRegistry::new();

    let mut worker_config = WorkerConfig::default();
    worker_config.progress_flush_n = 1;
    let pool = Arc::new(WorkerPool::new(
        1,
        store.clone(),
        Arc::new(ScriptedProcessor::always_succeeds(1.0)),
        lease.clone(),
        Arc::new(SystemClock),
        Arc::new(NoOpEventSink),
        Arc::new(StatsCollector::default()),
        cancellation.clone(),
        worker_config,
    ));

    let control = ControlApi::new(
        store.clone(),
        cancellation,
        batch_core::config::RetryCounterPolicy::Reset,
        0.1,
    );

    lease.acquire(batch.id, &ACQUIRABLE).await.unwrap();
    assert!(pool.submit(batch.id).await);

    // Wait for the worker to make some progress before cancelling it, the
    // same in-process signalling path `ControlApi::cancel` is meant to hit.
    loop {
        if store.get(batch.id).await.unwrap().success_count >= 5 {
            break;
        }
        tokio::task::yield_now().await;
    }

    control.cancel(batch.id).await.unwrap();
    pool.drain(Some(Duration::from_secs(5))).await;

    let finished = store.get(batch.id).await.unwrap();
    assert_eq!(finished.status, BatchStatus::Cancelled);
    assert!(finished.success_count < 200);
}

#[tokio::test]
async fn activity_pagination_resumes_from_cursor() {
    let store = Arc::new(InMemoryBatchStore::new());
    let (batch, refs) = sample_batch_with_activities(7);
    store.insert(&batch, &refs).await.unwrap();

    let page = store
        .list_activity_refs(batch.id, ActivityCursor::START, 3)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 3);
    assert!(page.next_cursor.is_some());
}
