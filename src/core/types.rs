//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for job records and job kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a persisted job record.
///
/// Assigned by the store at insertion time and stable for the record's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(i64);

/// Discriminator selecting which handler processes a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKind(String);

impl JobId {
    /// Create a JobId from its raw store value.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the underlying store value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self::new(id)
    }
}

impl JobKind {
    /// Create a new JobKind from a string.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobKind {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
