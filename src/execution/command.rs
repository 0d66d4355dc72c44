//! External command job handler.
//!
//! [`CommandJob`] runs an external program described by the job payload. It
//! backs the `test_run` kind: each payload names a test harness invocation and
//! the exit status decides the outcome.
//!
//! # Payload
//!
//! ```json
//! { "program": "cargo", "args": ["test", "--workspace"], "timeout_secs": 600 }
//! ```
//!
//! `env`, `working_dir` and `timeout_secs` are optional.
//!
//! # Outcomes
//!
//! - **Exit code 0**: success
//! - **Non-zero exit code**: [`JobError::Transient`] with the exit code and
//!   stderr, retried with backoff
//! - **Timeout**: [`JobError::Timeout`] (transient). The subprocess is killed
//!   when the command future is dropped.
//! - **Program cannot be started** or **payload is invalid**:
//!   [`JobError::Permanent`]
//!
//! # Example
//!
//! ```ignore
//! use jobq::CommandJob;
//! use std::time::Duration;
//!
//! let handler = CommandJob::builder("test_run")
//!     .default_timeout(Duration::from_secs(900))
//!     .env("CI", "true")
//!     .max_parallel(2)
//!     .build();
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::handler::{JobContext, JobError, JobHandler};
use crate::core::retry::RetryPolicy;
use crate::core::types::JobKind;

/// Command invocation carried in a job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Execution timeout in seconds; overrides the handler default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandSpec {
    /// Create a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_secs: None,
        }
    }

    /// Add arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Encode as a job payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A handler that executes the command described by each job's payload.
#[derive(Debug, Clone)]
pub struct CommandJob {
    kind: JobKind,
    /// Environment applied to every invocation; payload entries win.
    env: HashMap<String, String>,
    default_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    max_parallel: Option<usize>,
}

impl CommandJob {
    /// Create a new builder for a command job of the given kind.
    pub fn builder(kind: impl Into<JobKind>) -> CommandJobBuilder {
        CommandJobBuilder::new(kind)
    }

    /// Get the default timeout.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    async fn run(&self, spec: &CommandSpec) -> Result<(), JobError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        for (key, value) in self.env.iter().chain(spec.env.iter()) {
            cmd.env(key, value);
        }

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let limit = spec
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);

        let output = match limit {
            Some(duration) => timeout(duration, cmd.output())
                .await
                .map_err(|_| JobError::Timeout(duration))?,
            None => cmd.output().await,
        }
        .map_err(|e| JobError::permanent(format!("failed to start '{}': {}", spec.program, e)))?;

        if output.status.success() {
            tracing::debug!(
                program = %spec.program,
                stdout_bytes = output.stdout.len(),
                "Command completed"
            );
            Ok(())
        } else {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(JobError::transient(format!(
                "'{}' exited with code {}: {}",
                spec.program,
                code,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl JobHandler for CommandJob {
    fn kind(&self) -> JobKind {
        self.kind.clone()
    }

    async fn execute(&self, payload: Option<&[u8]>, _ctx: &mut JobContext) -> Result<(), JobError> {
        let payload = payload.ok_or_else(|| JobError::permanent("missing command payload"))?;
        let spec: CommandSpec = serde_json::from_slice(payload)?;
        self.run(&spec).await
    }

    fn max_retry_count(&self) -> u32 {
        self.retry_policy.max_retries
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_policy.delay_for(attempt)
    }

    fn max_parallel(&self) -> Option<usize> {
        self.max_parallel
    }

    fn description(&self) -> Option<&str> {
        Some("runs an external command")
    }
}

/// Builder for creating `CommandJob` instances.
#[derive(Debug, Clone)]
pub struct CommandJobBuilder {
    kind: JobKind,
    env: HashMap<String, String>,
    default_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    max_parallel: Option<usize>,
}

impl CommandJobBuilder {
    /// Create a new builder for the given kind.
    pub fn new(kind: impl Into<JobKind>) -> Self {
        Self {
            kind: kind.into(),
            env: HashMap::new(),
            default_timeout: None,
            retry_policy: RetryPolicy::default(),
            max_parallel: None,
        }
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the timeout used when the payload gives none.
    pub fn default_timeout(mut self, duration: Duration) -> Self {
        self.default_timeout = Some(duration);
        self
    }

    /// Set the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Limit concurrent executions of this kind.
    pub fn max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = Some(limit);
        self
    }

    /// Build the `CommandJob`.
    pub fn build(self) -> CommandJob {
        CommandJob {
            kind: self.kind,
            env: self.env,
            default_timeout: self.default_timeout,
            retry_policy: self.retry_policy,
            max_parallel: self.max_parallel,
        }
    }
}
