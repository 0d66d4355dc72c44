//! Scheduler type definitions.
//!
//! This module contains error types and the lifecycle state enum for the scheduler.

use crate::core::registry::RegistryError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Registry error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// `start()` was called outside a tokio runtime.
    #[error("no tokio runtime available to run the scheduler loop")]
    NoRuntime,
}

/// Lifecycle state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Created, loop not spawned yet.
    NotStarted,
    /// Loop is polling and dispatching.
    Running,
    /// Shutdown requested, waiting for the loop to exit.
    ShuttingDown,
    /// Loop exited or was never started.
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulerState::NotStarted => "not_started",
            SchedulerState::Running => "running",
            SchedulerState::ShuttingDown => "shutting_down",
            SchedulerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
