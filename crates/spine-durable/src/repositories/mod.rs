//! Narrow repository traits layered over the same dialect-driven connection
//! abstraction as the [`crate::ledger::Ledger`] (spec.md §4.2).

pub mod memory;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{ErrorCategory, SpineError};
use crate::model::{DeadLetter, Reject, Schedule};

pub use memory::InMemoryRepositories;
pub use postgres::PostgresRepositories;
pub use sqlite::SqliteRepositories;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RepositoryError> for SpineError {
    fn from(err: RepositoryError) -> Self {
        match &err {
            RepositoryError::NotFound => SpineError::new(ErrorCategory::Validation, err.to_string()),
            RepositoryError::Database(_) => {
                SpineError::new(ErrorCategory::Database, err.to_string()).with_retryable(true)
            }
            RepositoryError::Serialization(_) => {
                SpineError::new(ErrorCategory::Internal, err.to_string())
            }
        }
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

/// CRUD over `core_schedules` (spec.md §4.11).
#[async_trait]
pub trait ScheduleRepository: Send + Sync + 'static {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError>;
    async fn get(&self, schedule_id: Uuid) -> Result<Schedule, RepositoryError>;
    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>, RepositoryError>;
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepositoryError>;
    async fn list_all(&self) -> Result<Vec<Schedule>, RepositoryError>;
    async fn set_enabled(&self, schedule_id: Uuid, enabled: bool) -> Result<(), RepositoryError>;
    async fn record_dispatch(
        &self,
        schedule_id: Uuid,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

/// CRUD over `core_schedule_locks` / `core_concurrency_locks`, consulted by
/// [`crate::lock_manager::LockManager`] (spec.md §4.12).
#[async_trait]
pub trait LockRepository: Send + Sync + 'static {
    /// Attempt to acquire (or steal, if expired) the schedule lock. Returns
    /// `true` iff `holder` now holds it.
    async fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Release the lock iff `holder` currently owns it. Returns `true` iff a
    /// row was actually deleted — releasing an already-released or
    /// foreign-held lock is a no-op returning `false`.
    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        holder: &str,
    ) -> Result<bool, RepositoryError>;

    async fn is_schedule_locked(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn try_acquire_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn release_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
    ) -> Result<(), RepositoryError>;

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn force_release_all(&self) -> Result<u64, RepositoryError>;
}

/// CRUD over `core_dead_letters` (spec.md §4.7).
#[async_trait]
pub trait DlqRepository: Send + Sync + 'static {
    async fn add(&self, entry: &DeadLetter) -> Result<(), RepositoryError>;
    async fn get(&self, id: Uuid) -> Result<DeadLetter, RepositoryError>;
    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError>;
    async fn mark_retry_attempted(&self, id: Uuid) -> Result<(), RepositoryError>;
    async fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<(), RepositoryError>;
}

/// CRUD over `core_manifest`, the idempotency markers for the tracked runner
/// (spec.md §4.10).
#[async_trait]
pub trait ManifestRepository: Send + Sync + 'static {
    async fn has_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<bool, RepositoryError>;

    async fn record_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<(), RepositoryError>;
}

/// Append-only sink over `core_rejects` for malformed records encountered
/// during processing (spec.md §3). Never updated or deleted in place — a
/// corrected record is reprocessed and produces a new run, not a rewrite of
/// the reject row.
#[async_trait]
pub trait RejectRepository: Send + Sync + 'static {
    async fn add(&self, reject: &Reject) -> Result<(), RepositoryError>;

    async fn list_for_partition(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Vec<Reject>, RepositoryError>;

    async fn count_for_batch(&self, batch_id: &str) -> Result<u64, RepositoryError>;
}
