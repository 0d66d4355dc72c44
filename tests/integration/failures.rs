//! Failure handling integration tests.
//!
//! Tests that verify permanent failures, panicking handlers, unknown kinds,
//! and executor rejections are handled without losing or duplicating work.

use async_trait::async_trait;
use jobq::testing::{FailingJob, TrackingJob};
use jobq::{
    Executor, ExecutorRejected, FailureReason, InMemoryJobStore, JobContext, JobError, JobEvent,
    JobFuture, JobHandler, JobKind, JobScheduler, JobStore, RetryPolicy, TokioExecutor,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::common::{registry_of, scheduler_with_recorder};

const WAIT: Duration = Duration::from_secs(5);

/// Refuses the first `remaining` submissions, then runs jobs normally.
struct RejectFirst {
    remaining: AtomicUsize,
    inner: TokioExecutor,
}

impl RejectFirst {
    fn new(remaining: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(remaining),
            inner: TokioExecutor::default(),
        })
    }
}

impl Executor for RejectFirst {
    fn spawn(&self, job: JobFuture) -> Result<(), ExecutorRejected> {
        let reject = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if reject {
            return Err(ExecutorRejected::Saturated {
                pending: 0,
                capacity: 0,
            });
        }
        self.inner.spawn(job)
    }
}

/// Panics on its first attempt and succeeds afterwards.
struct PanicOnceJob {
    panicked: AtomicBool,
}

#[async_trait]
impl JobHandler for PanicOnceJob {
    fn kind(&self) -> JobKind {
        JobKind::new("panic_once")
    }

    async fn execute(&self, _: Option<&[u8]>, _: &mut JobContext) -> Result<(), JobError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("boom");
        }
        Ok(())
    }

    fn retry_delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

#[tokio::test]
async fn test_permanent_failure_is_never_retried() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(
        FailingJob::always("doomed")
            .permanent()
            .with_error("feature disabled")
            .with_retry_policy(RetryPolicy::fixed(5, Duration::ZERO)),
    );
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![job.clone() as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;

    scheduler.queue().submit("doomed", None).await.unwrap();
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(
                e,
                JobEvent::Failed {
                    reason: FailureReason::Permanent,
                    attempts: 1,
                    ..
                }
            ))
            .await
    );
    // Several more polls pass without another attempt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.shutdown().await;

    assert_eq!(job.call_count().await, 1);
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(
        recorder
            .count(|e| matches!(e, JobEvent::RetryScheduled { .. }))
            .await,
        0
    );
}

#[tokio::test]
async fn test_panicking_handler_is_retried() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(PanicOnceJob {
        panicked: AtomicBool::new(false),
    });
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![job as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;

    scheduler.queue().submit("panic_once", None).await.unwrap();
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;

    let retried = recorder
        .count(|e| match e {
            JobEvent::RetryScheduled { error, .. } => error.contains("boom"),
            _ => false,
        })
        .await;
    assert_eq!(retried, 1);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_kind_is_deleted() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![Arc::new(TrackingJob::new("known", Duration::ZERO)) as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;

    let ghost = store.insert(&JobKind::new("ghost"), None).await.unwrap();
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::UnknownKind { .. }))
            .await
    );
    scheduler.shutdown().await;

    assert!(store.get(ghost).await.is_err());
    assert_eq!(
        recorder
            .count(|e| matches!(e, JobEvent::Started { .. }))
            .await,
        0
    );
}

#[tokio::test]
async fn test_rejected_job_stays_due_without_consuming_retries() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(TrackingJob::new("busy", Duration::ZERO));
    let scheduler = JobScheduler::new(store.clone(), registry_of(vec![job as Arc<dyn JobHandler>]))
        .with_executor(RejectFirst::new(usize::MAX))
        .with_poll_interval(Duration::from_secs(3600));
    let recorder = jobq::testing::RecordingEventHandler::new();
    scheduler.event_bus().register(recorder.clone()).await;

    let id = scheduler.queue().submit("busy", None).await.unwrap();
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Rejected { .. }))
            .await
    );
    scheduler.shutdown().await;

    let record = store.get(id).await.unwrap();
    assert_eq!(record.retry_count, 0);
    assert_eq!(scheduler.in_flight_count(), 0);
}

#[tokio::test]
async fn test_rejected_job_runs_on_a_later_poll() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(TrackingJob::new("busy", Duration::ZERO));
    let scheduler = JobScheduler::new(store.clone(), registry_of(vec![job as Arc<dyn JobHandler>]))
        .with_executor(RejectFirst::new(2))
        .with_poll_interval(Duration::from_millis(20));
    let recorder = jobq::testing::RecordingEventHandler::new();
    scheduler.event_bus().register(recorder.clone()).await;

    scheduler.queue().submit("busy", None).await.unwrap();
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;

    assert_eq!(
        recorder
            .count(|e| matches!(e, JobEvent::Rejected { .. }))
            .await,
        2
    );
    assert_eq!(
        recorder
            .count(|e| matches!(e, JobEvent::Started { attempt: 1, .. }))
            .await,
        1
    );
}

#[tokio::test]
async fn test_rejected_gated_job_does_not_leak_the_slot() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(
        TrackingJob::new("serial", Duration::from_millis(5))
            .with_max_parallel(1),
    );
    let scheduler = JobScheduler::new(
        store.clone(),
        registry_of(vec![job.clone() as Arc<dyn JobHandler>]),
    )
    .with_executor(RejectFirst::new(1))
    .with_poll_interval(Duration::from_millis(20));
    let recorder = jobq::testing::RecordingEventHandler::new();
    scheduler.event_bus().register(recorder.clone()).await;

    let queue = scheduler.queue();
    queue.submit("serial", None).await.unwrap();
    queue.submit("serial", None).await.unwrap();
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(2, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;

    assert_eq!(job.completed().await, 2);
    assert_eq!(job.peak_concurrency(), 1);
    assert_eq!(store.count().await.unwrap(), 0);
}
