//! jobq - A durable background job scheduler.
//!
//! Usage:
//!   jobq run [--config FILE]              Run the scheduler until Ctrl+C
//!   jobq submit --config FILE KIND [DATA] Persist a job for a running scheduler
//!   jobq validate --config FILE           Check configuration and handlers

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use jobq::{
    CommandJob, EventBus, EventHandler, InMemoryJobStore, JobContext, JobError, JobEvent,
    JobHandler, JobKind, JobQueue, JobRegistry, JobRegistryBuilder, JobScheduler, JobStore,
    Notifier, SchedulerConfig, StorageConfig, TokioExecutor, YamlLoader,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Kinds this binary knows how to execute.
const MAIL: &str = "mail";
const TEST_RUN: &str = "test_run";

/// jobq - A durable background job scheduler
#[derive(Parser)]
#[command(name = "jobq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "JOBQ_CONFIG")]
        config: Option<PathBuf>,

        /// Poll interval in seconds (overrides the configuration file)
        #[arg(long)]
        poll_interval: Option<u64>,
    },

    /// Insert a job into the configured store
    Submit {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "JOBQ_CONFIG")]
        config: PathBuf,

        /// Job kind
        #[arg(value_name = "KIND")]
        kind: String,

        /// Job payload, stored as UTF-8 bytes
        #[arg(value_name = "PAYLOAD")]
        payload: Option<String>,
    },

    /// Validate configuration and the kind registry without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(short, long, env = "JOBQ_CONFIG")]
        config: PathBuf,
    },
}

/// Body of a `mail` job.
#[derive(Debug, Deserialize)]
struct MailMessage {
    to: String,
    subject: String,
    #[serde(default)]
    body: String,
}

/// Renders queued mail into the log; delivery is left to the host.
struct MailJob;

#[async_trait]
impl JobHandler for MailJob {
    fn kind(&self) -> JobKind {
        JobKind::new(MAIL)
    }

    async fn execute(&self, payload: Option<&[u8]>, ctx: &mut JobContext) -> Result<(), JobError> {
        let payload = payload.ok_or_else(|| JobError::permanent("mail job has no message"))?;
        let message: MailMessage = serde_json::from_slice(payload)?;

        info!(
            job_id = %ctx.job_id(),
            to = %message.to,
            subject = %message.subject,
            bytes = message.body.len(),
            "Sending mail"
        );
        Ok(())
    }

    fn max_parallel(&self) -> Option<usize> {
        Some(1)
    }

    fn description(&self) -> Option<&str> {
        Some("renders an outgoing e-mail")
    }
}

/// Logs settled jobs.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &JobEvent) {
        match event {
            JobEvent::Succeeded {
                job_id,
                kind,
                duration,
                ..
            } => {
                info!("Job {} ({}) succeeded in {:?}", job_id, kind, duration);
            }
            JobEvent::RetryScheduled {
                job_id,
                kind,
                retry_count,
                next_attempt_at,
                ..
            } => {
                info!(
                    "Job {} ({}) will retry (#{}) at {}",
                    job_id, kind, retry_count, next_attempt_at
                );
            }
            JobEvent::Failed {
                job_id,
                kind,
                attempts,
                error,
                ..
            } => {
                error!(
                    "Job {} ({}) dropped after {} attempt(s): {}",
                    job_id, kind, attempts, error
                );
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            poll_interval,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(secs) = poll_interval {
                config = config.with_poll_interval_secs(secs);
                config.validate()?;
            }
            run_scheduler(config).await?;
        }
        Commands::Submit {
            config,
            kind,
            payload,
        } => {
            let config = load_config(Some(&config))?;
            submit_job(config, kind, payload).await?;
        }
        Commands::Validate { config } => {
            validate(config)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<SchedulerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(YamlLoader::load_config(path)?)
        }
        None => {
            info!("No configuration file given; using defaults");
            Ok(SchedulerConfig::default())
        }
    }
}

/// Build the registry of built-in kinds with configured overrides applied.
fn build_registry(config: &SchedulerConfig) -> Result<JobRegistry, Box<dyn std::error::Error>> {
    let test_run = CommandJob::builder(TEST_RUN)
        .default_timeout(Duration::from_secs(30 * 60))
        .build();

    let registry = JobRegistryBuilder::new([MAIL, TEST_RUN])
        .with_handler(Arc::new(MailJob))?
        .with_handler(Arc::new(test_run))?
        .with_parallelism_overrides(
            config
                .max_parallel
                .iter()
                .map(|(kind, limit)| (kind.clone(), *limit)),
        )?
        .build()?;

    Ok(registry)
}

async fn open_store(
    config: &SchedulerConfig,
) -> Result<Arc<dyn JobStore>, Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            warn!("Using in-memory storage; jobs are lost on exit");
            Ok(Arc::new(InMemoryJobStore::new()))
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Opening SQLite store at: {}", path);
            Ok(Arc::new(jobq::SqliteJobStore::new(path).await?))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requested but jobq was built without the `sqlite` feature".into())
        }
    }
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler(config: SchedulerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = build_registry(&config)?;
    for kind in registry.kinds() {
        let limit = registry
            .get(kind)
            .and_then(|entry| entry.max_parallel())
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "unbounded".to_string());
        info!("  - {} (max_parallel: {})", kind, limit);
    }

    let store = open_store(&config).await?;

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let executor = Arc::new(TokioExecutor::new(
        config.executor.max_workers,
        config.executor.queue_capacity,
    ));

    let scheduler = JobScheduler::new(store, Arc::new(registry))
        .with_executor(executor.clone())
        .with_event_bus(event_bus)
        .with_poll_interval(config.poll_interval())
        .with_poll_batch_size(config.poll_batch_size)
        .with_shutdown_timeout(config.shutdown_timeout());

    info!(
        "Starting scheduler (poll interval: {}s)...",
        config.poll_interval_secs
    );
    info!("Press Ctrl+C to stop");
    scheduler.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    scheduler.shutdown().await;
    executor.close();
    if !executor.drain(config.shutdown_timeout()).await {
        warn!("Some jobs were still running at exit; they will be retried on the next start");
    }

    info!("Goodbye!");
    Ok(())
}

/// Persist one job for whichever scheduler runs against the same store.
async fn submit_job(
    config: SchedulerConfig,
    kind: String,
    payload: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = build_registry(&config)?;
    let kind = JobKind::new(kind);
    if !registry.contains(&kind) {
        let known: Vec<&str> = registry.kinds().map(|k| k.as_str()).collect();
        error!("Unknown job kind '{}'. Known kinds: {}", kind, known.join(", "));
        return Err(format!("unknown job kind '{}'", kind).into());
    }

    let store = open_store(&config).await?;
    let queue = JobQueue::new(store, Notifier::new());
    let id = queue
        .submit(kind.clone(), payload.map(String::into_bytes))
        .await?;

    println!("Submitted job {} ({})", id, kind);
    Ok(())
}

/// Validate configuration and the registry without running.
fn validate(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating: {}", path.display());

    let config = YamlLoader::load_config(&path).inspect_err(|e| {
        error!("Validation failed: {}", e);
    })?;
    let registry = build_registry(&config).inspect_err(|e| {
        error!("Validation failed: {}", e);
    })?;

    info!("Configuration is valid ({} kind(s))", registry.len());
    Ok(())
}
