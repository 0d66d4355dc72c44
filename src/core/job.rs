//! Persisted job records.
//!
//! A [`JobRecord`] is the durable, at-least-once unit of work. It is created by a
//! producer, read by the scheduler when due, and either deleted (success,
//! permanent failure, exhausted retries) or rescheduled in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{JobId, JobKind};

/// A pending job as stored in the job table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned identity.
    pub id: JobId,
    /// Which handler executes this job.
    pub kind: JobKind,
    /// Opaque bytes interpreted only by the handler.
    pub payload: Option<Vec<u8>>,
    /// Original insertion time.
    pub created_at: DateTime<Utc>,
    /// The job is due once this is in the past.
    pub next_attempt_at: DateTime<Utc>,
    /// Number of prior failed attempts.
    pub retry_count: u32,
}

impl JobRecord {
    /// Create a freshly inserted record that is immediately due.
    pub fn new(id: JobId, kind: JobKind, payload: Option<Vec<u8>>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            payload,
            created_at: now,
            next_attempt_at: now,
            retry_count: 0,
        }
    }

    /// Check if the record is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }

    /// Apply a retry: bump the counter, move the due time and optionally swap the payload.
    pub fn reschedule(
        &mut self,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        payload: Option<Vec<u8>>,
    ) {
        self.retry_count = retry_count;
        self.next_attempt_at = next_attempt_at;
        if payload.is_some() {
            self.payload = payload;
        }
    }
}
