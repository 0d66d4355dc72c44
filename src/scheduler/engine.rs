//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Polling the store for due jobs, skipping those already in flight
//! - Dispatching each job through its kind's concurrency gate or straight to the executor
//! - Settling outcomes: delete on success, reschedule or drop on failure
//! - Coalescing wake-ups from producers into immediate polls
//! - Graceful shutdown with a bounded wait
//!
//! A job id enters the in-flight set before dispatch and leaves it only after
//! its outcome was recorded, so a record never runs concurrently with itself.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::notifier::Notifier;
use super::queue::JobQueue;
use super::types::{SchedulerError, SchedulerState};
use crate::core::handler::{JobContext, JobError, JobHandler};
use crate::core::job::JobRecord;
use crate::core::registry::JobRegistry;
use crate::core::types::{JobId, JobKind};
use crate::events::{EventBus, FailureReason, JobEvent};
use crate::execution::{ConcurrencyGate, Executor, ExecutorRejected, TokioExecutor};
use crate::storage::{JobStore, StorageError};

/// Default interval between polls when no wake-up arrives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on how long `shutdown()` waits for the loop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of records fetched per poll.
pub const DEFAULT_POLL_BATCH_SIZE: usize = 100;

struct Lifecycle {
    state: SchedulerState,
    handle: Option<JoinHandle<()>>,
}

/// Durable job scheduler.
///
/// # Example
///
/// ```ignore
/// let scheduler = JobScheduler::new(store, Arc::new(registry))
///     .with_poll_interval(Duration::from_secs(5))
///     .with_shutdown_timeout(Duration::from_secs(30));
///
/// scheduler.start()?;
/// scheduler.queue().submit("mail", Some(body)).await?;
/// // ...
/// scheduler.shutdown().await;
/// ```
pub struct JobScheduler {
    /// Storage backend.
    store: Arc<dyn JobStore>,
    /// Validated kind registry.
    registry: Arc<JobRegistry>,
    /// Executor job bodies run on.
    executor: Arc<dyn Executor>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Wake-up signal shared with producers.
    notifier: Notifier,
    /// Ids queued or executing.
    in_flight: Arc<DashSet<JobId>>,
    /// Set once shutdown was requested; never cleared.
    shutdown_requested: Arc<AtomicBool>,
    poll_interval: Duration,
    poll_batch_size: usize,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl JobScheduler {
    /// Create a new scheduler over `store` executing kinds from `registry`.
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>) -> Self {
        Self {
            store,
            registry,
            executor: Arc::new(TokioExecutor::default()),
            event_bus: Arc::new(EventBus::new()),
            notifier: Notifier::new(),
            in_flight: Arc::new(DashSet::new()),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_batch_size: DEFAULT_POLL_BATCH_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            lifecycle: Mutex::new(Lifecycle {
                state: SchedulerState::NotStarted,
                handle: None,
            }),
        }
    }

    /// Set the executor.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Use an existing notifier, e.g. one shared with producers in another component.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum number of records fetched per poll.
    pub fn with_poll_batch_size(mut self, size: usize) -> Self {
        self.poll_batch_size = size.max(1);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Get the registry.
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Get the notifier.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Create a producer handle bound to this scheduler's store and notifier.
    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.store.clone(), self.notifier.clone())
    }

    /// Ask the loop to poll now.
    pub fn poll_now(&self) {
        self.notifier.notify();
    }

    /// Number of jobs queued in gates or executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        self.lock_lifecycle().state
    }

    // Critical sections never panic, so a poisoned guard still holds consistent state.
    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the scheduler loop.
    ///
    /// Calling this twice is a no-op. If shutdown was requested before the
    /// first start, the scheduler stays stopped.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lock_lifecycle();

        match lifecycle.state {
            SchedulerState::NotStarted => {}
            SchedulerState::Stopped if self.shutdown_requested.load(Ordering::SeqCst) => {
                tracing::info!("Shutdown already requested; scheduler will not start");
                return Ok(());
            }
            state => {
                tracing::warn!(state = %state, "Scheduler already started; ignoring start()");
                return Ok(());
            }
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let gates = self
            .registry
            .kinds()
            .filter_map(|kind| {
                let limit = self.registry.get(kind)?.max_parallel()?;
                Some((kind.clone(), Arc::new(ConcurrencyGate::new(limit))))
            })
            .collect();

        let inner = Arc::new(SchedulerInner {
            store: self.store.clone(),
            registry: self.registry.clone(),
            executor: self.executor.clone(),
            event_bus: self.event_bus.clone(),
            notifier: self.notifier.clone(),
            in_flight: self.in_flight.clone(),
            shutdown_requested: self.shutdown_requested.clone(),
            gates,
            rejections: AtomicU64::new(0),
            poll_interval: self.poll_interval,
            poll_batch_size: self.poll_batch_size,
        });

        tracing::info!(
            poll_interval = ?self.poll_interval,
            kinds = self.registry.len(),
            "Starting job scheduler"
        );
        lifecycle.handle = Some(runtime.spawn(inner.run()));
        lifecycle.state = SchedulerState::Running;
        Ok(())
    }

    /// Stop dispatching and wait for the loop to exit.
    ///
    /// Waits at most the shutdown timeout; on timeout the loop task is aborted
    /// and an error is logged. Jobs already executing are not cancelled.
    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.notifier.notify();

        let handle = {
            let mut lifecycle = self.lock_lifecycle();
            match lifecycle.state {
                SchedulerState::Running => {
                    lifecycle.state = SchedulerState::ShuttingDown;
                    lifecycle.handle.take()
                }
                SchedulerState::NotStarted => {
                    lifecycle.state = SchedulerState::Stopped;
                    tracing::info!("Scheduler shut down before it was started");
                    None
                }
                _ => None,
            }
        };

        let Some(mut handle) = handle else {
            return;
        };

        tracing::info!(timeout = ?self.shutdown_timeout, "Shutting down job scheduler");
        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {
                tracing::info!(in_flight = self.in_flight.len(), "Job scheduler stopped");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Scheduler loop terminated abnormally");
            }
            Err(_) => {
                handle.abort();
                tracing::error!(
                    timeout = ?self.shutdown_timeout,
                    "Scheduler loop did not stop within the shutdown timeout"
                );
            }
        }

        self.lock_lifecycle().state = SchedulerState::Stopped;
    }
}

/// State shared by the loop task and the executor tasks.
struct SchedulerInner {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    executor: Arc<dyn Executor>,
    event_bus: Arc<EventBus>,
    notifier: Notifier,
    in_flight: Arc<DashSet<JobId>>,
    shutdown_requested: Arc<AtomicBool>,
    /// One gate per bounded kind.
    gates: HashMap<JobKind, Arc<ConcurrencyGate>>,
    /// Executor rejections so far.
    rejections: AtomicU64,
    poll_interval: Duration,
    poll_batch_size: usize,
}

impl SchedulerInner {
    fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Main scheduler loop.
    async fn run(self: Arc<Self>) {
        while !self.is_shutting_down() {
            let backlog = match self.poll_once().await {
                Ok(outcome) => outcome.has_backlog(self.poll_batch_size),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to poll for due jobs");
                    false
                }
            };

            if self.is_shutting_down() {
                break;
            }
            if backlog {
                tracing::debug!(batch = self.poll_batch_size, "Full batch polled; polling again");
                tokio::task::yield_now().await;
                continue;
            }
            self.notifier.wait(self.poll_interval).await;
        }

        tracing::debug!("Scheduler loop exited");
    }

    /// Fetch due records and dispatch each one that is not already in flight.
    async fn poll_once(self: &Arc<Self>) -> Result<PollOutcome, StorageError> {
        let rejections_before = self.rejections.load(Ordering::SeqCst);
        let exclude: HashSet<JobId> = self.in_flight.iter().map(|id| *id).collect();
        let due = self
            .store
            .fetch_due(&exclude, Utc::now(), self.poll_batch_size)
            .await?;

        if !due.is_empty() {
            tracing::debug!(due = due.len(), in_flight = exclude.len(), "Polled due jobs");
        }
        let fetched = due.len();
        self.event_bus.emit(JobEvent::polled(fetched)).await;

        for job in due {
            if self.is_shutting_down() {
                tracing::debug!("Shutdown requested; leaving remaining due jobs for later");
                break;
            }

            if !self.registry.contains(&job.kind) {
                self.drop_unknown_kind(job).await;
                continue;
            }

            if let Some(claim) = InFlightClaim::acquire(&self.in_flight, job.id) {
                self.dispatch(job, claim).await;
            }
        }

        Ok(PollOutcome {
            fetched,
            rejected: self.rejections.load(Ordering::SeqCst) != rejections_before,
        })
    }

    async fn drop_unknown_kind(&self, job: JobRecord) {
        tracing::error!(
            job_id = %job.id,
            kind = %job.kind,
            retry_count = job.retry_count,
            "No handler registered for job kind; deleting record"
        );
        if let Err(e) = self.store.delete(job.id).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to delete job with unknown kind");
        }
        self.event_bus
            .emit(JobEvent::unknown_kind(job.id, job.kind))
            .await;
    }

    /// Route a job through its gate, or straight to the executor for unbounded kinds.
    async fn dispatch(self: &Arc<Self>, job: JobRecord, claim: InFlightClaim<'_>) {
        tracing::debug!(
            job_id = %job.id,
            kind = %job.kind,
            retry_count = job.retry_count,
            "Dispatching job"
        );
        self.event_bus
            .emit(JobEvent::dispatched(job.id, job.kind.clone()))
            .await;

        match self.gates.get(&job.kind) {
            Some(gate) => {
                let start = gate.enqueue(job);
                claim.hand_off();
                if start {
                    self.start_worker(gate.clone()).await;
                }
            }
            None => {
                let (id, kind) = (job.id, job.kind.clone());
                let inner = self.clone();
                let spawned = self.executor.spawn(Box::pin(async move {
                    inner.execute_and_settle(job).await;
                }));
                claim.hand_off();
                if let Err(e) = spawned {
                    self.reject(id, kind, e).await;
                }
            }
        }
    }

    /// Start a worker for a slot the caller already claimed on `gate`.
    ///
    /// If the executor refuses the worker, the job it would have run is
    /// released and the next head is tried, until a worker runs or the queue
    /// is empty and the slot is given back.
    async fn start_worker(self: &Arc<Self>, gate: Arc<ConcurrencyGate>) {
        while let Some(job) = gate.next_or_release() {
            let (id, kind) = (job.id, job.kind.clone());
            let inner = self.clone();
            let worker_gate = gate.clone();
            let spawned = self.executor.spawn(Box::pin(async move {
                inner.drain_gate(worker_gate, job).await;
            }));

            match spawned {
                Ok(()) => return,
                Err(e) => self.reject(id, kind, e).await,
            }
        }
    }

    /// Worker body: run jobs from the gate until its queue is empty.
    async fn drain_gate(self: Arc<Self>, gate: Arc<ConcurrencyGate>, first: JobRecord) {
        let mut next = Some(first);
        while let Some(job) = next {
            self.execute_and_settle(job).await;

            if self.is_shutting_down() {
                self.release_queued(&gate);
                return;
            }
            next = gate.next_or_release();
        }
    }

    /// Give back every queued job so the next process start picks it up.
    fn release_queued(&self, gate: &ConcurrencyGate) {
        while let Some(job) = gate.next_or_release() {
            tracing::debug!(job_id = %job.id, kind = %job.kind, "Releasing queued job at shutdown");
            self.in_flight.remove(&job.id);
        }
    }

    async fn reject(&self, id: JobId, kind: JobKind, error: ExecutorRejected) {
        tracing::warn!(
            job_id = %id,
            kind = %kind,
            error = %error,
            "Executor rejected job; it stays due for the next poll"
        );
        self.in_flight.remove(&id);
        self.rejections.fetch_add(1, Ordering::SeqCst);
        self.event_bus
            .emit(JobEvent::rejected(id, kind, error.to_string()))
            .await;
    }

    /// Run one attempt and record its outcome, then release the id.
    async fn execute_and_settle(&self, job: JobRecord) {
        let Some(entry) = self.registry.get(&job.kind) else {
            self.in_flight.remove(&job.id);
            return;
        };
        let handler = entry.handler().clone();
        let attempt = job.retry_count + 1;

        self.event_bus
            .emit(JobEvent::started(job.id, job.kind.clone(), attempt))
            .await;
        let started = Instant::now();

        let ctx = JobContext::new(job.id, job.kind.clone(), job.retry_count, job.created_at);
        let (result, updated_payload) =
            run_handler(handler.clone(), job.payload.clone(), ctx).await;

        self.settle(
            &job,
            handler.as_ref(),
            result,
            updated_payload,
            started.elapsed(),
        )
        .await;
        self.in_flight.remove(&job.id);
    }

    async fn settle(
        &self,
        job: &JobRecord,
        handler: &dyn JobHandler,
        result: Result<(), JobError>,
        updated_payload: Option<Vec<u8>>,
        elapsed: Duration,
    ) {
        let attempts = job.retry_count + 1;

        let error = match result {
            Ok(()) => {
                tracing::debug!(
                    job_id = %job.id,
                    kind = %job.kind,
                    elapsed = ?elapsed,
                    "Job succeeded"
                );
                self.delete_record(job).await;
                self.event_bus
                    .emit(JobEvent::succeeded(job.id, job.kind.clone(), elapsed))
                    .await;
                return;
            }
            Err(e) => e,
        };

        if error.is_permanent() {
            tracing::error!(
                job_id = %job.id,
                kind = %job.kind,
                retry_count = job.retry_count,
                created_at = %job.created_at,
                error = %error,
                "Job failed permanently; deleting record"
            );
            self.delete_record(job).await;
            self.event_bus
                .emit(JobEvent::failed(
                    job.id,
                    job.kind.clone(),
                    FailureReason::Permanent,
                    error.to_string(),
                    attempts,
                ))
                .await;
            return;
        }

        let max_retries = handler.max_retry_count();
        if job.retry_count < max_retries {
            let retry_count = job.retry_count + 1;
            let delay = handler.retry_delay(retry_count);
            let next_attempt_at = next_attempt_after(Utc::now(), delay);

            match self
                .store
                .update(job.id, retry_count, next_attempt_at, updated_payload)
                .await
            {
                Ok(()) => {
                    tracing::warn!(
                        job_id = %job.id,
                        kind = %job.kind,
                        retry_count,
                        max_retries,
                        next_attempt_at = %next_attempt_at,
                        error = %error,
                        "Job failed; retry scheduled"
                    );
                    self.event_bus
                        .emit(JobEvent::retry_scheduled(
                            job.id,
                            job.kind.clone(),
                            retry_count,
                            next_attempt_at,
                            error.to_string(),
                        ))
                        .await;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        kind = %job.kind,
                        error = %e,
                        "Failed to record job retry; it will run again on a later poll"
                    );
                }
            }
        } else {
            tracing::error!(
                job_id = %job.id,
                kind = %job.kind,
                retry_count = job.retry_count,
                max_retries,
                created_at = %job.created_at,
                error = %error,
                "Job retry budget exceeded; deleting record"
            );
            self.delete_record(job).await;
            self.event_bus
                .emit(JobEvent::failed(
                    job.id,
                    job.kind.clone(),
                    FailureReason::RetriesExhausted,
                    error.to_string(),
                    attempts,
                ))
                .await;
        }
    }

    async fn delete_record(&self, job: &JobRecord) {
        match self.store.delete(job.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job_id = %job.id, "Job record already gone");
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    error = %e,
                    "Failed to delete job record; it will run again on a later poll"
                );
            }
        }
    }
}

/// What a single poll saw.
struct PollOutcome {
    fetched: usize,
    rejected: bool,
}

impl PollOutcome {
    /// A full batch means more due records may be waiting. After a rejection
    /// the executor is saturated, so the loop waits instead.
    fn has_backlog(&self, batch_size: usize) -> bool {
        self.fetched >= batch_size && !self.rejected
    }
}

/// Membership of one id in the in-flight set, undone on drop unless handed off.
///
/// The loop task can be aborted while a dispatch is suspended; the id must
/// not stay claimed when no gate or executor task owns it.
struct InFlightClaim<'a> {
    in_flight: &'a DashSet<JobId>,
    id: JobId,
    handed_off: bool,
}

impl<'a> InFlightClaim<'a> {
    fn acquire(in_flight: &'a DashSet<JobId>, id: JobId) -> Option<Self> {
        in_flight.insert(id).then(|| Self {
            in_flight,
            id,
            handed_off: false,
        })
    }

    /// A gate or executor task now owns the id.
    fn hand_off(mut self) {
        self.handed_off = true;
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if !self.handed_off {
            self.in_flight.remove(&self.id);
        }
    }
}

/// Execute the handler on its own task so a panic surfaces as a transient failure.
async fn run_handler(
    handler: Arc<dyn JobHandler>,
    payload: Option<Vec<u8>>,
    mut ctx: JobContext,
) -> (Result<(), JobError>, Option<Vec<u8>>) {
    let attempt = tokio::spawn(async move {
        let result = handler.execute(payload.as_deref(), &mut ctx).await;
        (result, ctx.take_updated_payload())
    });

    match attempt.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            (
                Err(JobError::Transient(format!("handler panicked: {}", message))),
                None,
            )
        }
        Err(e) => (
            Err(JobError::Transient(format!("handler task failed: {}", e))),
            None,
        ),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// `now + delay`, saturating at the latest representable time.
fn next_attempt_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
