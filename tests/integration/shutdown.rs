//! Graceful shutdown integration tests.
//!
//! Tests that verify the scheduler stops dispatching on shutdown, leaves
//! running jobs alone, releases queued work for the next start, and gives up
//! on a stuck loop after the shutdown timeout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq::testing::{TrackingJob, wait_until};
use jobq::{
    EventHandler, InMemoryJobStore, JobEvent, JobHandler, JobId, JobKind, JobRecord, JobScheduler,
    JobStore, JobTransaction, SchedulerState, StorageError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{registry_of, scheduler_with_recorder};

const WAIT: Duration = Duration::from_secs(5);

/// Store whose polls never complete.
struct HangingStore {
    inner: InMemoryJobStore,
}

#[async_trait]
impl JobStore for HangingStore {
    async fn insert(
        &self,
        kind: &JobKind,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        self.inner.insert(kind, payload).await
    }

    async fn fetch_due(
        &self,
        _exclude: &HashSet<JobId>,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        std::future::pending().await
    }

    async fn delete(&self, id: JobId) -> Result<bool, StorageError> {
        self.inner.delete(id).await
    }

    async fn update(
        &self,
        id: JobId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        self.inner
            .update(id, retry_count, next_attempt_at, payload)
            .await
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, StorageError> {
        self.inner.get(id).await
    }

    async fn count(&self) -> Result<usize, StorageError> {
        self.inner.count().await
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StorageError> {
        self.inner.begin().await
    }
}

/// Test: Shutdown leaves a running job to finish and record its outcome.
#[tokio::test]
async fn test_shutdown_does_not_cancel_running_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(TrackingJob::new("slow", Duration::from_millis(200)));
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![job.clone() as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;

    scheduler.queue().submit("slow", None).await.unwrap();
    scheduler.start().unwrap();
    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Started { .. }))
            .await
    );

    // The loop exits promptly; the job body is not awaited.
    let shutdown_start = Instant::now();
    scheduler.shutdown().await;
    assert!(shutdown_start.elapsed() < Duration::from_millis(200));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await,
        "Job should have completed after shutdown"
    );
    assert_eq!(job.completed().await, 1);
    assert_eq!(store.count().await.unwrap(), 0);
}

/// Test: Jobs waiting behind a gate are released, not run, after shutdown.
#[tokio::test]
async fn test_shutdown_releases_queued_jobs() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(
        TrackingJob::new("serial", Duration::from_millis(100))
            .with_max_parallel(1),
    );
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![job.clone() as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;

    let queue = scheduler.queue();
    for _ in 0..3 {
        queue.submit("serial", None).await.unwrap();
    }
    scheduler.start().unwrap();
    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Started { .. }))
            .await
    );

    scheduler.shutdown().await;

    let scheduler = &scheduler;
    assert!(
        wait_until(WAIT, || async move { scheduler.in_flight_count() == 0 })
            .await
    );
    assert_eq!(job.completed().await, 1);
    assert_eq!(store.count().await.unwrap(), 2);
}

/// Test: Nothing is dispatched once shutdown returned.
#[tokio::test]
async fn test_no_dispatch_after_shutdown() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![Arc::new(TrackingJob::new("quick", Duration::ZERO)) as Arc<dyn JobHandler>],
        Duration::from_millis(10),
    )
    .await;

    scheduler.start().unwrap();
    scheduler.shutdown().await;

    scheduler.queue().submit("quick", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        recorder
            .count(|e| matches!(e, JobEvent::Dispatched { .. }))
            .await,
        0
    );
    assert_eq!(store.count().await.unwrap(), 1);
}

/// Test: Shutdown before start leaves the scheduler stopped for good.
#[tokio::test]
async fn test_shutdown_before_start() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![Arc::new(TrackingJob::new("quick", Duration::ZERO)) as Arc<dyn JobHandler>],
        Duration::from_millis(10),
    )
    .await;

    scheduler.shutdown().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    scheduler.start().unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(recorder.events().await.is_empty());
}

/// Test: A second start is a no-op.
#[tokio::test]
async fn test_start_twice_is_noop() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(TrackingJob::new("quick", Duration::ZERO));
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![job.clone() as Arc<dyn JobHandler>],
        Duration::from_secs(3600),
    )
    .await;

    scheduler.queue().submit("quick", None).await.unwrap();
    scheduler.start().unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Running);

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;

    assert_eq!(job.completed().await, 1);
    assert_eq!(
        recorder
            .count(|e| matches!(e, JobEvent::Started { .. }))
            .await,
        1
    );
}

/// Test: Shutdown gives up on a stuck loop after the timeout.
#[tokio::test]
async fn test_shutdown_timeout_exceeded() {
    let store = Arc::new(HangingStore {
        inner: InMemoryJobStore::new(),
    });
    let job = Arc::new(TrackingJob::new("quick", Duration::ZERO));
    let scheduler = JobScheduler::new(store, registry_of(vec![job as Arc<dyn JobHandler>]))
        .with_shutdown_timeout(Duration::from_millis(100));

    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let shutdown_start = Instant::now();
    scheduler.shutdown().await;
    let elapsed = shutdown_start.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < WAIT, "Shutdown took {:?}", elapsed);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

/// Event handler that never returns once a job is dispatched.
struct StallOnDispatch;

#[async_trait]
impl EventHandler for StallOnDispatch {
    async fn handle(&self, event: &JobEvent) {
        if matches!(event, JobEvent::Dispatched { .. }) {
            std::future::pending::<()>().await;
        }
    }
}

/// Test: Aborting a loop stuck mid-dispatch does not leave the id claimed.
#[tokio::test]
async fn test_aborted_dispatch_releases_in_flight_id() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(TrackingJob::new("quick", Duration::ZERO));
    let scheduler = JobScheduler::new(
        store.clone(),
        registry_of(vec![job.clone() as Arc<dyn JobHandler>]),
    )
    .with_poll_interval(Duration::from_millis(10))
    .with_shutdown_timeout(Duration::from_millis(100));
    scheduler
        .event_bus()
        .register(Arc::new(StallOnDispatch))
        .await;

    scheduler.queue().submit("quick", None).await.unwrap();
    scheduler.start().unwrap();

    let scheduler = &scheduler;
    assert!(
        wait_until(WAIT, || async move { scheduler.in_flight_count() == 1 })
            .await
    );

    scheduler.shutdown().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    // Abort is observed once the task is polled again.
    assert!(
        wait_until(WAIT, || async move { scheduler.in_flight_count() == 0 })
            .await
    );
    assert_eq!(job.completed().await, 0);
    assert_eq!(store.count().await.unwrap(), 1);
}
