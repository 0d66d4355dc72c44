//! Core domain types: identifiers, job records, handlers, retry policy and the
//! kind registry.

pub mod handler;
pub mod job;
pub mod registry;
pub mod retry;
pub mod types;
