//! jobq - A durable background job scheduler.
//!
//! Jobs are persisted before they run, executed by kind-specific handlers,
//! limited per kind by concurrency gates, and retried with backoff until they
//! succeed or exhaust their budget.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, ExecutorConfig, SchedulerConfig, StorageConfig, YamlLoader};
pub use core::handler::{JobContext, JobError, JobHandler};
pub use core::job::JobRecord;
pub use core::registry::{JobRegistry, JobRegistryBuilder, RegisteredKind, RegistryError};
pub use core::retry::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAYS, RetryPolicy};
pub use core::types::{JobId, JobKind};
pub use events::{EventBus, EventHandler, FailureReason, JobEvent};
pub use execution::{
    CommandJob, CommandJobBuilder, CommandSpec, ConcurrencyGate, Executor, ExecutorRejected,
    JobFuture, TokioExecutor,
};
pub use scheduler::{
    DEFAULT_POLL_BATCH_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT, JobQueue,
    JobScheduler, Notifier, SchedulerError, SchedulerState, WAKE_HOOK_KEY,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteJobStore;
pub use storage::{
    CommitHook, CommitHooks, InMemoryJobStore, JobStore, JobTransaction, StorageError,
};
