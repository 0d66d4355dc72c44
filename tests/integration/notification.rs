//! Wake-up notification integration tests.
//!
//! Tests that verify producers wake the scheduler immediately, that wake-ups
//! issued inside a transaction wait for commit, and that many submissions in
//! one transaction cause a single extra poll.

use jobq::testing::{TrackingJob, wait_until};
use jobq::{InMemoryJobStore, JobEvent, JobHandler, JobQueue, JobScheduler, JobStore, Notifier};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{registry_of, scheduler_with_recorder};

/// Long enough that only wake-ups trigger polls during a test.
const IDLE_POLL: Duration = Duration::from_secs(3600);
const WAIT: Duration = Duration::from_secs(5);

fn quick_job() -> Arc<dyn JobHandler> {
    Arc::new(TrackingJob::new("quick", Duration::from_millis(1)))
}

fn is_polled(event: &JobEvent) -> bool {
    matches!(event, JobEvent::Polled { .. })
}

#[tokio::test]
async fn test_submit_wakes_idle_scheduler() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) =
        scheduler_with_recorder(store.clone(), vec![quick_job()], IDLE_POLL).await;

    scheduler.start().unwrap();
    assert!(recorder.wait_for(1, WAIT, is_polled).await);

    scheduler.queue().submit("quick", None).await.unwrap();

    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_transaction_submissions_coalesce_into_one_poll() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) =
        scheduler_with_recorder(store.clone(), vec![quick_job()], IDLE_POLL).await;

    scheduler.start().unwrap();
    assert!(recorder.wait_for(1, WAIT, is_polled).await);

    let queue = scheduler.queue();
    let mut tx = queue.begin().await.unwrap();
    for _ in 0..10 {
        queue.submit_in(tx.as_mut(), "quick", None).await.unwrap();
    }

    // Nothing is visible or signalled before commit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(is_polled).await, 1);

    tx.commit().await.unwrap();

    assert!(
        recorder
            .wait_for(10, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.shutdown().await;

    let polls: Vec<usize> = recorder
        .events()
        .await
        .iter()
        .filter_map(|e| match e {
            JobEvent::Polled { due, .. } => Some(*due),
            _ => None,
        })
        .collect();
    assert_eq!(polls, vec![0, 10]);
}

#[tokio::test]
async fn test_rolled_back_transaction_does_not_wake() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) =
        scheduler_with_recorder(store.clone(), vec![quick_job()], IDLE_POLL).await;

    scheduler.start().unwrap();
    assert!(recorder.wait_for(1, WAIT, is_polled).await);

    let queue = scheduler.queue();
    let mut tx = queue.begin().await.unwrap();
    queue.submit_in(tx.as_mut(), "quick", None).await.unwrap();
    queue.poll_now(Some(tx.as_mut()));
    tx.rollback().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(is_polled).await, 1);
    assert_eq!(store.count().await.unwrap(), 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_poll_now_without_transaction() {
    let store = Arc::new(InMemoryJobStore::new());
    let (scheduler, recorder) =
        scheduler_with_recorder(store.clone(), vec![quick_job()], IDLE_POLL).await;

    scheduler.start().unwrap();
    assert!(recorder.wait_for(1, WAIT, is_polled).await);

    scheduler.poll_now();

    assert!(recorder.wait_for(2, WAIT, is_polled).await);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shared_notifier_wakes_scheduler_from_another_component() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = Arc::new(TrackingJob::new("quick", Duration::from_millis(1)));
    let notifier = Notifier::new();

    let registry = registry_of(vec![job.clone() as Arc<dyn JobHandler>]);
    let scheduler = JobScheduler::new(store.clone(), registry)
        .with_notifier(notifier.clone())
        .with_poll_interval(IDLE_POLL);
    scheduler.start().unwrap();

    // A producer that only knows the store and the notifier.
    let producer = JobQueue::new(store.clone(), notifier);
    producer.submit("quick", None).await.unwrap();

    let job = job.as_ref();
    assert!(
        wait_until(WAIT, || async move { job.completed().await == 1 })
            .await
    );
    scheduler.shutdown().await;
}
