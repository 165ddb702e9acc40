//! The durable ledger (spec.md §4.2): CRUD and queries over runs and events,
//! portable across SQLite and PostgreSQL via [`spine_dialect::Dialect`].
//!
//! `Ledger` is `async_trait`-based and object-safe so the dispatcher, worker
//! loop, and scheduler all hold it as `Arc<dyn Ledger>`, mirroring the
//! teacher's `Arc<dyn WorkflowEventStore>` convention.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::SpineError;
use crate::model::{Event, EventType, RunRecord, RunStatus};

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use sqlite::SqliteLedger;

/// Errors raised by a [`Ledger`] implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("illegal transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("concurrency conflict updating run {run_id}: expected it to be in one of {expected:?}")]
    ConcurrencyConflict {
        run_id: Uuid,
        expected: Vec<RunStatus>,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<LedgerError> for SpineError {
    fn from(err: LedgerError) -> Self {
        use crate::errors::ErrorCategory;
        match &err {
            LedgerError::RunNotFound(_) => SpineError::new(ErrorCategory::Validation, err.to_string()),
            LedgerError::InvalidTransition { .. } => {
                SpineError::new(ErrorCategory::Orchestration, err.to_string())
            }
            LedgerError::ConcurrencyConflict { .. } => {
                SpineError::new(ErrorCategory::Orchestration, err.to_string()).with_retryable(true)
            }
            LedgerError::Database(_) => {
                SpineError::new(ErrorCategory::Database, err.to_string()).with_retryable(true)
            }
            LedgerError::Serialization(_) => SpineError::new(ErrorCategory::Internal, err.to_string()),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

/// Filters accepted by [`Ledger::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    pub status: Option<RunStatus>,
    pub name: Option<String>,
    pub parent_run_id: Option<Uuid>,
}

#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Persist a newly-created run, in `Pending` status.
    async fn create_run(&self, run: &RunRecord) -> Result<(), LedgerError>;

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError>;

    /// Atomically transition `run_id` to `status`, enforced by `UPDATE ...
    /// WHERE status IN (...)` against `source_states_for(status)` (spec.md
    /// §4.3). Zero affected rows is a [`LedgerError::ConcurrencyConflict`].
    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<Value>,
        error: Option<&SpineError>,
    ) -> Result<(), LedgerError>;

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
    ) -> Result<Event, LedgerError>;

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<Event>, LedgerError>;

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>, LedgerError>;

    async fn list_runs(
        &self,
        filters: RunFilters,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>, LedgerError>;

    async fn get_children(&self, parent_run_id: Uuid) -> Result<Vec<RunRecord>, LedgerError>;

    /// Select up to `batch_size` pending runs ordered by `created_at` and
    /// atomically transition each to `Running`, tagging `external_ref` with
    /// `worker_id` (spec.md §4.8 step 1). A run that another worker claims
    /// first loses the race silently — its `update_status` call affects zero
    /// rows and is simply skipped, never reported as an error.
    async fn claim_pending(
        &self,
        batch_size: u32,
        worker_id: &str,
    ) -> Result<Vec<RunRecord>, LedgerError> {
        let candidates = self
            .list_runs(
                RunFilters {
                    status: Some(RunStatus::Pending),
                    ..Default::default()
                },
                batch_size,
                0,
            )
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut run in candidates {
            match self
                .update_status(run.run_id, RunStatus::Running, None, None)
                .await
            {
                Ok(()) => {
                    run.mark_running();
                    claimed.push(run);
                }
                Err(LedgerError::ConcurrencyConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(worker_id, claimed = claimed.len(), "worker claimed pending runs");
        Ok(claimed)
    }
}

/// Aggregate run statistics over the trailing `hours`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
    pub avg_duration_seconds: Option<f64>,
}

/// Narrow analytics surface over the run table (spec.md §4.2).
#[async_trait]
pub trait ExecutionRepository: Send + Sync + 'static {
    async fn stats(&self, hours: i64) -> Result<RunStats, LedgerError>;

    /// Runs stuck `running` for longer than `threshold_min` minutes.
    async fn stale_executions(&self, threshold_min: i64) -> Result<Vec<RunRecord>, LedgerError>;

    async fn recent_failures(&self, hours: i64, limit: u32) -> Result<Vec<RunRecord>, LedgerError>;
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
