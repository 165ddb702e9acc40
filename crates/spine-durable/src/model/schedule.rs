//! [`Schedule`]: a time-based trigger for a workflow or operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{ErrorCategory, SpineError};

/// What kind of handler a schedule dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTargetType {
    Workflow,
    Operation,
}

/// Either a cron expression or a fixed interval; at least one must be set
/// (spec.md §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleTiming {
    Cron(String),
    IntervalSeconds(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: Uuid,
    pub name: String,
    pub target_type: ScheduleTargetType,
    pub target_name: String,
    pub timing: ScheduleTiming,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub params: Value,
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        target_type: ScheduleTargetType,
        target_name: impl Into<String>,
        timing: ScheduleTiming,
    ) -> Result<Self, SpineError> {
        if let ScheduleTiming::Cron(ref expr) = timing {
            cron::Schedule::try_from(expr.as_str()).map_err(|e| {
                SpineError::new(
                    ErrorCategory::Validation,
                    format!("invalid cron expression {expr:?}: {e}"),
                )
            })?;
        }

        Ok(Self {
            schedule_id: Uuid::now_v7(),
            name: name.into(),
            target_type,
            target_name: target_name.into(),
            timing,
            enabled: true,
            next_run_at: None,
            last_run_at: None,
            params: Value::Object(serde_json::Map::new()),
        })
    }

    /// Whether `next_run_at` is due relative to `now` and the schedule is
    /// enabled (spec.md §4.11 step 1).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self
                .next_run_at
                .map(|due| due <= now)
                .unwrap_or(true)
    }

    /// Compute the next `next_run_at` after a dispatch at `from`.
    pub fn compute_next_run_at(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, SpineError> {
        match &self.timing {
            ScheduleTiming::IntervalSeconds(secs) => {
                Ok(from + chrono::Duration::seconds(*secs as i64))
            }
            ScheduleTiming::Cron(expr) => {
                let schedule = cron::Schedule::try_from(expr.as_str()).map_err(|e| {
                    SpineError::new(
                        ErrorCategory::Validation,
                        format!("invalid cron expression {expr:?}: {e}"),
                    )
                })?;
                schedule.after(&from).next().ok_or_else(|| {
                    SpineError::internal(format!(
                        "cron expression {expr:?} produced no further occurrences"
                    ))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_schedule_computes_next_run() {
        let sched = Schedule::new(
            "nightly_close",
            ScheduleTargetType::Workflow,
            "close.daily",
            ScheduleTiming::IntervalSeconds(3600),
        )
        .unwrap();
        let now = Utc::now();
        let next = sched.compute_next_run_at(now).unwrap();
        assert_eq!((next - now).num_seconds(), 3600);
    }

    #[test]
    fn enabled_schedule_after_dispatch_has_future_next_run() {
        let mut sched = Schedule::new(
            "hourly",
            ScheduleTargetType::Operation,
            "noop",
            ScheduleTiming::IntervalSeconds(60),
        )
        .unwrap();
        let now = Utc::now();
        sched.next_run_at = Some(sched.compute_next_run_at(now).unwrap());
        assert!(sched.next_run_at.unwrap() > now);
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let result = Schedule::new(
            "bad",
            ScheduleTargetType::Workflow,
            "x",
            ScheduleTiming::Cron("not a cron expression".to_string()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn due_schedule_with_no_prior_run_is_immediately_due() {
        let sched = Schedule::new(
            "first_run",
            ScheduleTargetType::Workflow,
            "x",
            ScheduleTiming::IntervalSeconds(60),
        )
        .unwrap();
        assert!(sched.is_due(Utc::now()));
    }
}
