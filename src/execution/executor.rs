//! Bounded job executor.
//!
//! The scheduler hands finished-polling work to an [`Executor`] and never waits
//! on it. [`TokioExecutor`] runs jobs as tokio tasks with:
//! - A worker limit enforced by a semaphore
//! - A bounded backlog of accepted but not yet running jobs
//! - Rejection instead of blocking once the backlog is full

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

/// A unit of work submitted to an executor.
pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Reasons an executor refuses work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorRejected {
    /// Every worker is busy and the backlog is full.
    #[error("executor saturated: {pending} jobs pending (capacity {capacity})")]
    Saturated { pending: usize, capacity: usize },

    /// The executor no longer accepts work.
    #[error("executor is closed")]
    Closed,

    /// No async runtime is available to run the job.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Runs job futures without blocking the caller.
pub trait Executor: Send + Sync {
    /// Submit a job. Must return promptly; rejection is reported, never awaited.
    fn spawn(&self, job: JobFuture) -> Result<(), ExecutorRejected>;
}

struct ExecutorState {
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

/// Decrements the pending count when a job finishes, including by panic.
struct PendingGuard(Arc<ExecutorState>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Executor running jobs on the tokio runtime with bounded concurrency.
pub struct TokioExecutor {
    /// Maximum number of concurrently running jobs.
    max_workers: usize,
    /// Maximum number of accepted jobs waiting for a worker.
    queue_capacity: usize,
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    state: Arc<ExecutorState>,
}

impl TokioExecutor {
    /// Create a new executor. A `max_workers` of zero is raised to one.
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            queue_capacity,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            state: Arc::new(ExecutorState {
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the worker limit.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Get the backlog capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Number of accepted jobs that have not finished.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Get the number of idle workers.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop accepting new jobs. Already accepted jobs still run.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }

    /// Check if the executor stopped accepting jobs.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Wait until every accepted job finished.
    ///
    /// Returns `false` if jobs were still running when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.state.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    pending = self.pending(),
                    timeout = ?timeout,
                    "Executor drain timed out with jobs still running"
                );
                false
            }
        }
    }
}

impl Default for TokioExecutor {
    fn default() -> Self {
        Self::new(8, 64)
    }
}

impl Executor for TokioExecutor {
    fn spawn(&self, job: JobFuture) -> Result<(), ExecutorRejected> {
        if self.is_closed() {
            return Err(ExecutorRejected::Closed);
        }
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| ExecutorRejected::NoRuntime)?;

        let capacity = self.max_workers + self.queue_capacity;
        let previous = self.state.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(self.state.clone());
        if previous >= capacity {
            drop(guard);
            return Err(ExecutorRejected::Saturated {
                pending: previous,
                capacity,
            });
        }

        let semaphore = self.semaphore.clone();
        handle.spawn(async move {
            let _guard = guard;
            let _permit = semaphore.acquire_owned().await.ok();
            job.await;
        });
        Ok(())
    }
}
