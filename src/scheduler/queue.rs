//! Job submission API.
//!
//! Producers use [`JobQueue`] to persist work. A successful submit only means
//! the record is durable; execution failures are never reported back here.

use std::sync::Arc;

use super::notifier::Notifier;
use crate::core::types::{JobId, JobKind};
use crate::storage::{JobStore, JobTransaction, StorageError};

/// Producer-side handle: inserts records and wakes the scheduler.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    notifier: Notifier,
}

impl JobQueue {
    /// Create a queue over `store` that wakes loops listening on `notifier`.
    pub fn new(store: Arc<dyn JobStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Get the notifier.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Insert a due job and wake the scheduler immediately.
    pub async fn submit(
        &self,
        kind: impl Into<JobKind>,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        let kind = kind.into();
        let id = self.store.insert(&kind, payload).await?;
        tracing::debug!(job_id = %id, kind = %kind, "Job submitted");
        self.notifier.notify();
        Ok(id)
    }

    /// Insert a due job inside `tx`; the wake-up fires when `tx` commits.
    pub async fn submit_in(
        &self,
        tx: &mut dyn JobTransaction,
        kind: impl Into<JobKind>,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        let kind = kind.into();
        let id = tx.insert(&kind, payload).await?;
        tracing::debug!(job_id = %id, kind = %kind, "Job submitted in transaction");
        self.notifier.notify_on_commit(tx);
        Ok(id)
    }

    /// Open a producer transaction on the underlying store.
    pub async fn begin(&self) -> Result<Box<dyn JobTransaction>, StorageError> {
        self.store.begin().await
    }

    /// Ask the scheduler to poll now, deferred to commit when `tx` is given.
    pub fn poll_now(&self, tx: Option<&mut dyn JobTransaction>) {
        self.notifier.poll_now(tx);
    }
}
