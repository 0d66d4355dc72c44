//! SQLite-backed scheduler tests.
//!
//! Tests that verify jobs survive a process restart and that retries and
//! transactional submissions are persisted by the SQLite store.

use jobq::testing::{FailingJob, TrackingJob};
use jobq::{JobEvent, JobHandler, JobKind, JobStore, RetryPolicy, SqliteJobStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::scheduler_with_recorder;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_jobs_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    // A producer persists work while no scheduler is running.
    let producer = SqliteJobStore::new(&path).await.unwrap();
    producer
        .insert(&JobKind::new("mail"), Some(b"hello".to_vec()))
        .await
        .unwrap();
    producer.insert(&JobKind::new("mail"), None).await.unwrap();
    producer.close().await;

    let store = Arc::new(SqliteJobStore::new(&path).await.unwrap());
    assert_eq!(store.count().await.unwrap(), 2);

    let mail = Arc::new(
        TrackingJob::new("mail", Duration::from_millis(5))
            .with_max_parallel(1),
    );
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![mail.clone() as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;
    scheduler.start().unwrap();

    assert!(
        recorder
            .wait_for(2, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;

    assert_eq!(mail.completed().await, 2);
    assert_eq!(store.count().await.unwrap(), 0);
    store.close().await;
}

#[tokio::test]
async fn test_retry_state_is_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");
    let store = Arc::new(SqliteJobStore::new(&path).await.unwrap());

    let job = FailingJob::always("flaky")
        .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(3600)));
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![Arc::new(job) as Arc<dyn JobHandler>],
        Duration::from_millis(20),
    )
    .await;

    let id = scheduler.queue().submit("flaky", None).await.unwrap();
    scheduler.start().unwrap();
    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::RetryScheduled { .. }))
            .await
    );
    scheduler.shutdown().await;
    store.close().await;

    let reopened = SqliteJobStore::new(&path).await.unwrap();
    let record = reopened.get(id).await.unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(
        record.next_attempt_at > record.created_at + chrono::Duration::minutes(59)
    );
    reopened.close().await;
}

#[tokio::test]
async fn test_transactional_submit_runs_after_commit() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteJobStore::new(dir.path().join("jobs.db"))
            .await
            .unwrap(),
    );

    let job = Arc::new(TrackingJob::new("report", Duration::ZERO));
    let (scheduler, recorder) = scheduler_with_recorder(
        store.clone(),
        vec![job.clone() as Arc<dyn JobHandler>],
        Duration::from_secs(3600),
    )
    .await;
    scheduler.start().unwrap();
    assert!(
        recorder
            .wait_for(1, WAIT, |e| matches!(e, JobEvent::Polled { .. }))
            .await
    );

    let queue = scheduler.queue();
    let mut tx = queue.begin().await.unwrap();
    for _ in 0..3 {
        queue.submit_in(tx.as_mut(), "report", None).await.unwrap();
    }
    tx.commit().await.unwrap();

    assert!(
        recorder
            .wait_for(3, WAIT, |e| matches!(e, JobEvent::Succeeded { .. }))
            .await
    );
    scheduler.shutdown().await;

    assert_eq!(job.completed().await, 3);
    assert_eq!(store.count().await.unwrap(), 0);
    store.close().await;
}
