//! Per-kind concurrency gate.
//!
//! A gate caps how many jobs of one kind execute at once. Ready records wait in
//! a FIFO queue; the caller that makes a job ready either becomes a worker
//! (when a slot is free) or leaves the job queued for an existing worker.
//!
//! Every state change happens in one locked step so a job is never stranded in
//! the queue with no worker to pick it up:
//!
//! ```text
//! enqueue:          push; if active < limit { active += 1; become worker }
//! next_or_release:  pop head, or (queue empty) active -= 1 and stop
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::core::job::JobRecord;

#[derive(Debug, Default)]
struct GateState {
    queue: VecDeque<JobRecord>,
    active_workers: usize,
}

/// FIFO queue plus worker count for one bounded kind.
#[derive(Debug)]
pub struct ConcurrencyGate {
    max_parallel: usize,
    state: Mutex<GateState>,
}

impl ConcurrencyGate {
    /// Create a gate allowing `max_parallel` concurrent workers (at least one).
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            state: Mutex::new(GateState::default()),
        }
    }

    // No code panics while holding the lock, so a poisoned guard still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The worker limit.
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Append a ready job.
    ///
    /// Returns `true` if the caller claimed a worker slot and must start a
    /// worker that drains the queue with [`next_or_release`](Self::next_or_release).
    pub fn enqueue(&self, job: JobRecord) -> bool {
        let mut state = self.lock();
        state.queue.push_back(job);
        if state.active_workers < self.max_parallel {
            state.active_workers += 1;
            true
        } else {
            false
        }
    }

    /// Called by a worker for its next job.
    ///
    /// Returns the queue head, or releases the worker slot and returns `None`
    /// when the queue is empty.
    pub fn next_or_release(&self) -> Option<JobRecord> {
        let mut state = self.lock();
        let next = state.queue.pop_front();
        if next.is_none() {
            state.active_workers = state.active_workers.saturating_sub(1);
        }
        next
    }

    /// Number of workers currently holding a slot.
    pub fn active_workers(&self) -> usize {
        self.lock().active_workers
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}
