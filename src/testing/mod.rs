//! Testing utilities for users of the jobq library.
//!
//! This module provides helpers for exercising the scheduler end to end:
//!
//! - [`FailingJob`]: A handler that fails N times then succeeds
//! - [`TrackingJob`]: A handler that sleeps and records execution windows
//! - [`RecordingEventHandler`]: Captures lifecycle events for assertions

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::core::handler::{JobContext, JobError, JobHandler};
use crate::core::retry::RetryPolicy;
use crate::core::types::{JobId, JobKind};
use crate::events::{EventHandler, JobEvent};

/// A job that fails a configurable number of times before succeeding.
///
/// Useful for testing retry logic and error handling. Failures are transient
/// unless [`FailingJob::permanent`] is set.
///
/// # Example
///
/// ```
/// use jobq::testing::FailingJob;
///
/// // Fails 2 times, then succeeds on the 3rd attempt
/// let job = FailingJob::new("flaky", 2);
/// ```
pub struct FailingJob {
    kind: JobKind,
    state: Mutex<FailingJobState>,
    total_failures: u32,
    error_message: String,
    permanent: bool,
    retry_policy: RetryPolicy,
    max_parallel: Option<usize>,
}

struct FailingJobState {
    failures_remaining: u32,
    attempts: Vec<Instant>,
}

impl FailingJob {
    /// Create a job that fails `fail_count` times then succeeds.
    ///
    /// Retries are immediately due so tests do not wait on backoff.
    pub fn new(kind: impl Into<JobKind>, fail_count: u32) -> Self {
        Self {
            kind: kind.into(),
            state: Mutex::new(FailingJobState {
                failures_remaining: fail_count,
                attempts: Vec::new(),
            }),
            total_failures: fail_count,
            error_message: "intentional test failure".to_string(),
            permanent: false,
            retry_policy: RetryPolicy::fixed(fail_count, Duration::ZERO),
            max_parallel: None,
        }
    }

    /// Create a job that always fails and is never retried.
    pub fn always(kind: impl Into<JobKind>) -> Self {
        Self::new(kind, u32::MAX).with_retry_policy(RetryPolicy::none())
    }

    /// Use a custom error message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Report failures as permanent.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the kind's parallelism limit.
    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit);
        self
    }

    /// Number of times the job has executed.
    pub async fn call_count(&self) -> u32 {
        self.state.lock().await.attempts.len() as u32
    }

    /// Start instants of every attempt, in order.
    pub async fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().await.attempts.clone()
    }

    /// Reset the failure counter for reuse.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.failures_remaining = self.total_failures;
        state.attempts.clear();
    }
}

#[async_trait]
impl JobHandler for FailingJob {
    fn kind(&self) -> JobKind {
        self.kind.clone()
    }

    async fn execute(
        &self,
        _payload: Option<&[u8]>,
        _ctx: &mut JobContext,
    ) -> Result<(), JobError> {
        // Check-and-decrement under one lock so concurrent attempts stay deterministic
        let mut state = self.state.lock().await;
        state.attempts.push(Instant::now());

        if state.failures_remaining == 0 {
            return Ok(());
        }
        state.failures_remaining -= 1;

        if self.permanent {
            Err(JobError::permanent(self.error_message.clone()))
        } else {
            Err(JobError::transient(self.error_message.clone()))
        }
    }

    fn max_retry_count(&self) -> u32 {
        self.retry_policy.max_retries
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_policy.delay_for(attempt)
    }

    fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }
}

/// One execution of a [`TrackingJob`].
#[derive(Debug, Clone)]
pub struct ExecutionWindow {
    pub job_id: JobId,
    pub started: Instant,
    pub finished: Instant,
}

impl ExecutionWindow {
    /// Check whether two windows overlap in time.
    pub fn overlaps(&self, other: &ExecutionWindow) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// A job that sleeps for a fixed duration and records when it ran.
///
/// Also tracks the highest number of simultaneous executions.
pub struct TrackingJob {
    kind: JobKind,
    work: Duration,
    max_parallel: Option<usize>,
    running: AtomicUsize,
    peak: AtomicUsize,
    windows: Mutex<Vec<ExecutionWindow>>,
}

impl TrackingJob {
    /// Create a job of `kind` whose every execution takes `work`.
    pub fn new(kind: impl Into<JobKind>, work: Duration) -> Self {
        Self {
            kind: kind.into(),
            work,
            max_parallel: None,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }

    /// Set the kind's parallelism limit.
    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit);
        self
    }

    /// Highest number of executions observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of finished executions.
    pub async fn completed(&self) -> usize {
        self.windows.lock().await.len()
    }

    /// Finished executions in completion order.
    pub async fn windows(&self) -> Vec<ExecutionWindow> {
        self.windows.lock().await.clone()
    }
}

#[async_trait]
impl JobHandler for TrackingJob {
    fn kind(&self) -> JobKind {
        self.kind.clone()
    }

    async fn execute(&self, _payload: Option<&[u8]>, ctx: &mut JobContext) -> Result<(), JobError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let started = Instant::now();
        tokio::time::sleep(self.work).await;
        let finished = Instant::now();

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.windows.lock().await.push(ExecutionWindow {
            job_id: ctx.job_id(),
            started,
            finished,
        });
        Ok(())
    }

    fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }
}

/// An event handler that keeps every event it receives.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<JobEvent>>,
}

impl RecordingEventHandler {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events received so far.
    pub async fn events(&self) -> Vec<JobEvent> {
        self.events.lock().await.clone()
    }

    /// Count events matching `predicate`.
    pub async fn count(&self, predicate: impl Fn(&JobEvent) -> bool) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| predicate(event))
            .count()
    }

    /// Wait until at least `n` events match `predicate`.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(
        &self,
        n: usize,
        timeout: Duration,
        predicate: impl Fn(&JobEvent) -> bool,
    ) -> bool {
        let predicate = &predicate;
        wait_until(timeout, || async move { self.count(predicate).await >= n }).await
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle(&self, event: &JobEvent) {
        self.events.lock().await.push(event.clone());
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
