//! Storage abstraction for the durable job table.
//!
//! This module provides a trait-based store with pluggable backends
//! (in-memory, SQLite). The store is the source of truth: records are read
//! without row locks and the scheduler deduplicates in-flight work itself.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

use crate::core::job::JobRecord;
use crate::core::types::{JobId, JobKind};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A stored value could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transaction was already finished.
    #[error("transaction already closed")]
    TransactionClosed,

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Callback run after a transaction commits.
pub type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// Keyed set of commit hooks; each key is registered at most once.
#[derive(Default)]
pub struct CommitHooks {
    hooks: Vec<(&'static str, CommitHook)>,
}

impl CommitHooks {
    /// Create an empty hook set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under `key`. Returns `false` if the key was already present.
    pub fn register(&mut self, key: &'static str, hook: CommitHook) -> bool {
        if self.hooks.iter().any(|(k, _)| *k == key) {
            return false;
        }
        self.hooks.push((key, hook));
        true
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Check if no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in registration order.
    pub fn run(self) {
        for (_, hook) in self.hooks {
            hook();
        }
    }
}

impl std::fmt::Debug for CommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(key, _)| key))
            .finish()
    }
}

/// Storage trait for the job table.
///
/// Implementations must be thread-safe and support concurrent access from the
/// scheduler loop and completion tasks.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a record that is due immediately.
    async fn insert(&self, kind: &JobKind, payload: Option<Vec<u8>>)
        -> Result<JobId, StorageError>;

    /// Fetch up to `limit` records with `next_attempt_at <= now`, skipping `exclude`.
    ///
    /// Results are ordered by `(next_attempt_at, id)`.
    async fn fetch_due(
        &self,
        exclude: &HashSet<JobId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Delete a record. Returns `false` if it did not exist.
    async fn delete(&self, id: JobId) -> Result<bool, StorageError>;

    /// Record a transient failure: set the retry counter and due time, and
    /// replace the payload when one is given.
    async fn update(
        &self,
        id: JobId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), StorageError>;

    /// Get a record by ID.
    async fn get(&self, id: JobId) -> Result<JobRecord, StorageError>;

    /// Number of stored records.
    async fn count(&self) -> Result<usize, StorageError>;

    /// Open a producer transaction.
    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StorageError>;
}

/// An open producer transaction.
///
/// Inserts become visible to the scheduler only after [`commit`](Self::commit).
/// Commit hooks run after a successful commit and are discarded on rollback or drop.
#[async_trait]
pub trait JobTransaction: Send {
    /// Insert a record inside the transaction.
    async fn insert(
        &mut self,
        kind: &JobKind,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError>;

    /// Register a hook to run after commit, once per `key`.
    ///
    /// Returns `false` if a hook with the same key is already registered.
    fn on_commit_once(&mut self, key: &'static str, hook: CommitHook) -> bool;

    /// Commit the transaction and run the commit hooks.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Roll the transaction back, dropping its inserts and hooks.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
