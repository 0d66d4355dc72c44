//! YAML configuration parsing.
//!
//! Parses scheduler settings from a YAML file:
//!
//! ```yaml
//! poll_interval_secs: 5
//! shutdown_timeout_secs: 30
//! poll_batch_size: 100
//! executor:
//!   max_workers: 8
//!   queue_capacity: 64
//! storage:
//!   type: sqlite
//!   path: jobq.db
//! max_parallel:
//!   mail: 1
//! ```
//!
//! Every field is optional and falls back to its default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::error::ConfigError;

/// Scheduler configuration (jobq.yaml).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between polls when no wake-up arrives.
    pub poll_interval_secs: u64,
    /// Seconds `shutdown()` waits for the loop to exit.
    pub shutdown_timeout_secs: u64,
    /// Maximum records fetched per poll.
    pub poll_batch_size: usize,
    /// Executor sizing.
    pub executor: ExecutorConfig,
    /// Storage backend.
    pub storage: StorageConfig,
    /// Per-kind parallelism overrides.
    pub max_parallel: BTreeMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            shutdown_timeout_secs: 30,
            poll_batch_size: 100,
            executor: ExecutorConfig::default(),
            storage: StorageConfig::default(),
            max_parallel: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Set the poll interval in seconds.
    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Set the shutdown timeout in seconds.
    pub fn with_shutdown_timeout_secs(mut self, secs: u64) -> Self {
        self.shutdown_timeout_secs = secs;
        self
    }

    /// Set the storage backend.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Override a kind's parallelism limit.
    pub fn with_max_parallel(mut self, kind: impl Into<String>, limit: usize) -> Self {
        self.max_parallel.insert(kind.into(), limit);
        self
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "shutdown_timeout_secs must be greater than zero".into(),
            ));
        }

        if self.poll_batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll_batch_size must be greater than zero".into(),
            ));
        }

        if self.executor.max_workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "executor.max_workers must be at least 1".into(),
            ));
        }

        if let Some((kind, _)) = self.max_parallel.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "max_parallel for '{}' must be at least 1",
                kind
            )));
        }

        if let StorageConfig::Sqlite { path } = &self.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "storage.path cannot be empty".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum concurrently running jobs.
    pub max_workers: usize,
    /// Accepted jobs allowed to wait for a worker before submissions are rejected.
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            queue_capacity: 64,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Loader for YAML configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load scheduler configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse_config(&content)
    }

    /// Parse scheduler configuration from a YAML string.
    pub fn parse_config(yaml: &str) -> Result<SchedulerConfig, ConfigError> {
        // An empty document means "all defaults".
        if yaml.trim().is_empty() {
            return Ok(SchedulerConfig::default());
        }
        let config: SchedulerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}
