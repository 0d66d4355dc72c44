//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the scheduler and its
//! storage backend.

mod error;
mod yaml;

pub use error::ConfigError;
pub use yaml::{ExecutorConfig, SchedulerConfig, StorageConfig, YamlLoader};
