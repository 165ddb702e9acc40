//! [`RunRecord`] and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::work_spec::WorkSpec;
use crate::errors::SpineError;

/// The durable status of a run. Terminal states (`Completed`, `Failed`,
/// `Cancelled`, `TimedOut`) are immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "timed_out" => Self::TimedOut,
            _ => return None,
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Allowed transitions, enforced before every `Ledger::update_status` call
/// (spec.md §4.3). An illegal transition never reaches the database.
pub fn is_allowed_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    match (from, to) {
        (Pending, Queued) => true,
        (Pending, Running) => true,
        (Queued, Running) => true,
        (Running, Completed) => true,
        (Running, Failed) => true,
        (Running, TimedOut) => true,
        (Pending, Cancelled) => true,
        (Queued, Cancelled) => true,
        (Running, Cancelled) => true,
        _ => false,
    }
}

/// Source states an `UPDATE ... WHERE status IN (...)` clause may target to
/// reach `to`, for the second-writer-loses discipline described in §4.3.
pub fn source_states_for(to: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match to {
        Queued => &[Pending],
        Running => &[Pending, Queued],
        Completed | Failed | TimedOut => &[Running],
        Cancelled => &[Pending, Queued, Running],
        Pending => &[],
    }
}

/// The durable unit of execution tracking (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub spec: WorkSpec,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub error_category: Option<String>,
    pub attempt: u32,
    pub retry_of_run_id: Option<Uuid>,
    pub parent_run_id: Option<Uuid>,
    pub external_ref: Option<String>,
}

impl RunRecord {
    /// Construct a fresh, original (non-retry) `RunRecord` for `spec`.
    pub fn new(spec: WorkSpec) -> Self {
        let parent_run_id = spec.parent_run_id;
        Self {
            run_id: Uuid::now_v7(),
            spec,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            error_type: None,
            error_category: None,
            attempt: 1,
            retry_of_run_id: None,
            parent_run_id,
            external_ref: None,
        }
    }

    /// Construct a retry of `source`, per spec.md §4.6: a *new* run, same
    /// spec, `attempt + 1`, linked via `retry_of_run_id`. The source run is
    /// never mutated.
    pub fn retry_of(source: &RunRecord) -> Self {
        let mut record = Self::new(source.spec.clone());
        record.attempt = source.attempt + 1;
        record.retry_of_run_id = Some(source.run_id);
        record
    }

    /// `duration_seconds`, derived from timestamps (spec.md §3).
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }

    pub fn mark_queued(&mut self) {
        self.status = RunStatus::Queued;
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
    }

    pub fn mark_completed(&mut self, result: Value) {
        self.status = RunStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &SpineError) {
        self.status = RunStatus::Failed;
        self.error = Some(error.message.clone());
        self.error_type = Some(error.error_type().to_string());
        self.error_category = Some(error.category.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_timed_out(&mut self) {
        self.status = RunStatus::TimedOut;
        self.completed_at = Some(Utc::now());
    }
}
