//! Lifecycle events and event handling.
//!
//! This module provides event emission for job lifecycle events, enabling
//! observability into polling, dispatch, and settlement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{JobId, JobKind};

/// Why a job was dropped without succeeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The handler reported a permanent failure.
    Permanent,
    /// The retry budget was used up.
    RetriesExhausted,
}

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A poll finished.
    Polled { due: usize, timestamp: Instant },

    /// A due job was handed to its gate or to the executor.
    Dispatched {
        job_id: JobId,
        kind: JobKind,
        timestamp: Instant,
    },

    /// A handler started executing.
    Started {
        job_id: JobId,
        kind: JobKind,
        /// 1-indexed attempt number (`retry_count + 1`).
        attempt: u32,
        timestamp: Instant,
    },

    /// A job succeeded and its record was deleted.
    Succeeded {
        job_id: JobId,
        kind: JobKind,
        duration: Duration,
        timestamp: Instant,
    },

    /// A transient failure was recorded and the job rescheduled.
    RetryScheduled {
        job_id: JobId,
        kind: JobKind,
        /// Retry counter after this failure.
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
        timestamp: Instant,
    },

    /// A job was dropped after a permanent failure or an exhausted budget.
    Failed {
        job_id: JobId,
        kind: JobKind,
        reason: FailureReason,
        error: String,
        /// Total executions, including the last one.
        attempts: u32,
        timestamp: Instant,
    },

    /// The executor refused the job; it stays due for the next poll.
    Rejected {
        job_id: JobId,
        kind: JobKind,
        error: String,
        timestamp: Instant,
    },

    /// A record had no registered handler and was deleted.
    UnknownKind {
        job_id: JobId,
        kind: JobKind,
        timestamp: Instant,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            JobEvent::Polled { timestamp, .. } => *timestamp,
            JobEvent::Dispatched { timestamp, .. } => *timestamp,
            JobEvent::Started { timestamp, .. } => *timestamp,
            JobEvent::Succeeded { timestamp, .. } => *timestamp,
            JobEvent::RetryScheduled { timestamp, .. } => *timestamp,
            JobEvent::Failed { timestamp, .. } => *timestamp,
            JobEvent::Rejected { timestamp, .. } => *timestamp,
            JobEvent::UnknownKind { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::Polled { .. } => None,
            JobEvent::Dispatched { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Rejected { job_id, .. }
            | JobEvent::UnknownKind { job_id, .. } => Some(*job_id),
        }
    }

    /// Create a Polled event.
    pub fn polled(due: usize) -> Self {
        JobEvent::Polled {
            due,
            timestamp: Instant::now(),
        }
    }

    /// Create a Dispatched event.
    pub fn dispatched(job_id: JobId, kind: JobKind) -> Self {
        JobEvent::Dispatched {
            job_id,
            kind,
            timestamp: Instant::now(),
        }
    }

    /// Create a Started event.
    pub fn started(job_id: JobId, kind: JobKind, attempt: u32) -> Self {
        JobEvent::Started {
            job_id,
            kind,
            attempt,
            timestamp: Instant::now(),
        }
    }

    /// Create a Succeeded event.
    pub fn succeeded(job_id: JobId, kind: JobKind, duration: Duration) -> Self {
        JobEvent::Succeeded {
            job_id,
            kind,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a RetryScheduled event.
    pub fn retry_scheduled(
        job_id: JobId,
        kind: JobKind,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Self {
        JobEvent::RetryScheduled {
            job_id,
            kind,
            retry_count,
            next_attempt_at,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create a Failed event.
    pub fn failed(
        job_id: JobId,
        kind: JobKind,
        reason: FailureReason,
        error: String,
        attempts: u32,
    ) -> Self {
        JobEvent::Failed {
            job_id,
            kind,
            reason,
            error,
            attempts,
            timestamp: Instant::now(),
        }
    }

    /// Create a Rejected event.
    pub fn rejected(job_id: JobId, kind: JobKind, error: String) -> Self {
        JobEvent::Rejected {
            job_id,
            kind,
            error,
            timestamp: Instant::now(),
        }
    }

    /// Create an UnknownKind event.
    pub fn unknown_kind(job_id: JobId, kind: JobKind) -> Self {
        JobEvent::UnknownKind {
            job_id,
            kind,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &JobEvent);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: JobEvent) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
