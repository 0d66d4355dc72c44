//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Timestamps are stored as
//! UTC milliseconds since the epoch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use super::{CommitHook, CommitHooks, JobStore, JobTransaction, StorageError};
use crate::core::job::JobRecord;
use crate::core::types::{JobId, JobKind};

type JobRow = (i64, String, Option<Vec<u8>>, i64, i64, i64);

const SELECT_COLUMNS: &str =
    "SELECT id, kind, payload, created_at, next_attempt_at, retry_count FROM job_queue";

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Create a new SQLite store with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(db_error)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    ///
    /// The pool holds a single connection, so an open transaction blocks other
    /// operations until it finishes.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_error)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_error)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_job_queue.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::Serialization(format!("invalid timestamp: {}", millis)))
}

fn row_to_record(row: JobRow) -> Result<JobRecord, StorageError> {
    let retry_count = u32::try_from(row.5)
        .map_err(|_| StorageError::Serialization(format!("invalid retry_count: {}", row.5)))?;

    Ok(JobRecord {
        id: JobId::new(row.0),
        kind: JobKind::new(row.1),
        payload: row.2,
        created_at: from_millis(row.3)?,
        next_attempt_at: from_millis(row.4)?,
        retry_count,
    })
}

const INSERT_SQL: &str = r#"
    INSERT INTO job_queue (kind, payload, created_at, next_attempt_at, retry_count)
    VALUES (?, ?, ?, ?, 0)
    "#;

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(
        &self,
        kind: &JobKind,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(INSERT_SQL)
            .bind(kind.as_str())
            .bind(payload)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(JobId::new(result.last_insert_rowid()))
    }

    async fn fetch_due(
        &self,
        exclude: &HashSet<JobId>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        // Over-fetch by the exclusion size so filtering still yields `limit` rows.
        let window = i64::try_from(limit.saturating_add(exclude.len())).unwrap_or(i64::MAX);
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "{} WHERE next_attempt_at <= ? ORDER BY next_attempt_at, id LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(window)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter()
            .filter(|row| !exclude.contains(&JobId::new(row.0)))
            .take(limit)
            .map(row_to_record)
            .collect()
    }

    async fn delete(&self, id: JobId) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update(
        &self,
        id: JobId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        payload: Option<Vec<u8>>,
    ) -> Result<(), StorageError> {
        let result = match payload {
            Some(payload) => {
                sqlx::query(
                    "UPDATE job_queue SET retry_count = ?, next_attempt_at = ?, payload = ? WHERE id = ?",
                )
                .bind(i64::from(retry_count))
                .bind(to_millis(next_attempt_at))
                .bind(payload)
                .bind(id.as_i64())
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE job_queue SET retry_count = ?, next_attempt_at = ? WHERE id = ?",
                )
                .bind(i64::from(retry_count))
                .bind(to_millis(next_attempt_at))
                    .bind(id.as_i64())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, StorageError> {
        let row: JobRow = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        row_to_record(row)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        usize::try_from(count)
            .map_err(|_| StorageError::Serialization(format!("invalid count: {}", count)))
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>, StorageError> {
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(Box::new(SqliteTransaction {
            tx,
            hooks: CommitHooks::new(),
        }))
    }
}

/// Producer transaction backed by a SQLite transaction.
struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    hooks: CommitHooks,
}

#[async_trait]
impl JobTransaction for SqliteTransaction {
    async fn insert(
        &mut self,
        kind: &JobKind,
        payload: Option<Vec<u8>>,
    ) -> Result<JobId, StorageError> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(INSERT_SQL)
            .bind(kind.as_str())
            .bind(payload)
            .bind(now)
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error)?;

        Ok(JobId::new(result.last_insert_rowid()))
    }

    fn on_commit_once(&mut self, key: &'static str, hook: CommitHook) -> bool {
        self.hooks.register(key, hook)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let SqliteTransaction { tx, hooks } = *self;
        tx.commit().await.map_err(db_error)?;
        hooks.run();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(db_error)
    }
}
