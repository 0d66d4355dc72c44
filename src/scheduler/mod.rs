//! Scheduler engine for durable jobs.
//!
//! This module provides the polling loop that dispatches due jobs, the
//! completion logic that settles their outcomes, the wake-up notifier, and the
//! producer-side submission API.

mod engine;
mod notifier;
mod queue;
mod types;

pub use engine::{
    DEFAULT_POLL_BATCH_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT, JobScheduler,
};
pub use notifier::{Notifier, WAKE_HOOK_KEY};
pub use queue::JobQueue;
pub use types::{SchedulerError, SchedulerState};
