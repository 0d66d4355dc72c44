//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use super::{CommitHook, CommitHooks, JobStore, JobTransaction, StorageError};
use crate::core::job::JobRecord;
use crate::core::types::{JobId, JobKind};

struct MemoryState {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    next_id: AtomicI64,
}

impl MemoryState {
    fn allocate_id(&self) -> JobId {
        JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts. Clones share the same table.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: Arc<MemoryState>,
}

impl InMemoryJobStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState {
                jobs: RwLock::new(HashMap::new()),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// Insert a fully specified record, replacing its ID with a fresh one.
    ///
    /// Useful for seeding records that are not due yet.
    pub fn insert_record(&self, mut record: JobRecord) -> Result<JobId, StorageError> {
        let id = self.state.allocate_id();
        record.id = id;
        let mut jobs = self
            .state
            .jobs
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        jobs.insert(id, record);
        Ok(id)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(
        &self,
        kind: &JobKind,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        let record = JobRecord::new(JobId::new(0), kind.clone(), payload, Utc::now());
        self.insert_record(record)
    }

    async fn fetch_due(
        &self,
        exclude: &HashSet<JobId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let jobs = self
            .state
            .jobs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut due: Vec<_> = jobs
            .values()
            .filter(|r| r.is_due(now) && !exclude.contains(&r.id))
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.next_attempt_at, a.id).cmp(&(b.next_attempt_at, b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete(&self, id: JobId) -> Result<bool, StorageError> {
        let mut jobs = self
            .state
            .jobs
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(jobs.remove(&id).is_some())
    }

    async fn update(
        &self,
        id: JobId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        let mut jobs = self
            .state
            .jobs
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        record.reschedule(retry_count, next_attempt_at, payload);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, StorageError> {
        let jobs = self
            .state
            .jobs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let jobs = self
            .state
            .jobs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(jobs.len())
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StorageError> {
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            pending: Vec::new(),
            hooks: CommitHooks::new(),
        }))
    }
}

/// Transaction buffering inserts until commit.
struct InMemoryTransaction {
    state: Arc<MemoryState>,
    pending: Vec<JobRecord>,
    hooks: CommitHooks,
}

#[async_trait]
impl JobTransaction for InMemoryTransaction {
    async fn insert(
        &mut self,
        kind: &JobKind,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        let id = self.state.allocate_id();
        self.pending
            .push(JobRecord::new(id, kind.clone(), payload, Utc::now()));
        Ok(id)
    }

    fn on_commit_once(&mut self, key: &'static str, hook: CommitHook) -> bool {
        self.hooks.register(key, hook)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let InMemoryTransaction {
            state,
            pending,
            hooks,
        } = *self;

        {
            let mut jobs = state.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
            for record in pending {
                jobs.insert(record.id, record);
            }
        }

        hooks.run();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}
