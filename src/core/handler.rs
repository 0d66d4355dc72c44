//! Job handler trait and error types.
//!
//! The `JobHandler` trait is the contract between the scheduler and a job kind's
//! business logic. Implement it once per kind and register it with a
//! [`JobRegistryBuilder`](super::registry::JobRegistryBuilder).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use super::retry::{DEFAULT_MAX_RETRIES, RetryPolicy};
use super::types::{JobId, JobKind};

/// Errors a handler can signal.
///
/// Only [`JobError::Permanent`] stops retries. Every other variant is treated as
/// transient and retried according to the handler's retry budget.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job can never succeed (disabled feature, unrecoverable input).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// A recoverable failure; the job should be retried later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The job exceeded its execution time limit.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// Any other error raised by the job body.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl JobError {
    /// Build a permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    /// Build a transient failure.
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient(message.into())
    }

    /// Check if this error must not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::Permanent(_))
    }
}

/// An undecodable payload can never succeed on retry.
impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        JobError::Permanent(format!("invalid payload: {}", e))
    }
}

/// Per-attempt execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: JobKind,
    retry_count: u32,
    created_at: DateTime<Utc>,
    updated_payload: Option<Vec<u8>>,
}

impl JobContext {
    /// Create a context for one execution attempt.
    pub fn new(job_id: JobId, kind: JobKind, retry_count: u32, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            kind,
            retry_count,
            created_at,
            updated_payload: None,
        }
    }

    /// The record being executed.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The kind of the record being executed.
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    /// Number of earlier failed attempts.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// When the job was first submitted. Handlers may use this to drop stale work.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Replace the stored payload if this attempt ends in a transient failure.
    ///
    /// Ignored on success and on permanent failure since the record is deleted.
    pub fn set_updated_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.updated_payload = Some(payload.into());
    }

    /// The revised payload, if the handler set one.
    pub fn updated_payload(&self) -> Option<&[u8]> {
        self.updated_payload.as_deref()
    }

    pub(crate) fn take_updated_payload(&mut self) -> Option<Vec<u8>> {
        self.updated_payload.take()
    }
}

/// The core trait for job kinds.
///
/// # Example
///
/// ```ignore
/// use jobq::{JobContext, JobError, JobHandler, JobKind};
/// use async_trait::async_trait;
///
/// struct MailJob;
///
/// #[async_trait]
/// impl JobHandler for MailJob {
///     fn kind(&self) -> JobKind {
///         JobKind::new("mail")
///     }
///
///     async fn execute(
///         &self,
///         payload: Option<&[u8]>,
///         _ctx: &mut JobContext,
///     ) -> Result<(), JobError> {
///         let body = payload.ok_or_else(|| JobError::permanent("missing message"))?;
///         send(body).await.map_err(|e| JobError::transient(e.to_string()))
///     }
///
///     fn max_parallel(&self) -> Option<usize> {
///         Some(1)
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The kind this handler executes.
    fn kind(&self) -> JobKind;

    /// Execute one attempt of a job.
    ///
    /// # Returns
    /// * `Ok(())` - the record is deleted
    /// * `Err(JobError::Permanent)` - the record is deleted without retry
    /// * any other `Err` - the record is retried while the budget allows
    async fn execute(&self, payload: Option<&[u8]>, ctx: &mut JobContext) -> Result<(), JobError>;

    /// Maximum number of retries after the initial attempt.
    fn max_retry_count(&self) -> u32 {
        DEFAULT_MAX_RETRIES
    }

    /// Delay before retry `attempt` (1-indexed).
    fn retry_delay(&self, attempt: u32) -> Duration {
        RetryPolicy::default().delay_for(attempt)
    }

    /// Maximum number of jobs of this kind executing at once. `None` is unbounded.
    fn max_parallel(&self) -> Option<usize> {
        None
    }

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}
