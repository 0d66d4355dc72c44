//! Job execution infrastructure.
//!
//! This module provides the bounded executor jobs run on, the per-kind
//! concurrency gate, and the external command handler.

mod command;
mod executor;
mod gate;

pub use command::{CommandJob, CommandJobBuilder, CommandSpec};
pub use executor::{Executor, ExecutorRejected, JobFuture, TokioExecutor};
pub use gate::ConcurrencyGate;
