//! [`DeadLetter`]: the parking place for failures pending post-hoc retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub params: Value,
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl DeadLetter {
    pub fn new(
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        params: Value,
        error: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            workflow_name: workflow_name.into(),
            params,
            error: error.into(),
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            last_retry_at: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// `unresolved ⇔ resolved_at is null` (spec.md §3 invariant).
    pub fn is_unresolved(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// `can_retry ⇔ unresolved ∧ retry_count < max_retries`.
    pub fn can_retry(&self) -> bool {
        self.is_unresolved() && self.retry_count < self.max_retries
    }

    pub fn mark_retry_attempted(&mut self) {
        self.retry_count += 1;
        self.last_retry_at = Some(Utc::now());
    }

    /// Terminal: once resolved, `resolved_by` is always set (spec.md §8).
    pub fn resolve(&mut self, resolved_by: impl Into<String>) {
        self.resolved_at = Some(Utc::now());
        self.resolved_by = Some(resolved_by.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_retry_respects_max_retries() {
        let mut dlq = DeadLetter::new(Uuid::now_v7(), "close.daily", Value::Null, "boom", 3);
        assert!(dlq.can_retry());
        dlq.mark_retry_attempted();
        dlq.mark_retry_attempted();
        dlq.mark_retry_attempted();
        assert_eq!(dlq.retry_count, 3);
        assert!(!dlq.can_retry());
    }

    #[test]
    fn resolved_entries_always_carry_resolved_by() {
        let mut dlq = DeadLetter::new(Uuid::now_v7(), "close.daily", Value::Null, "boom", 3);
        dlq.resolve("retry-worker");
        assert!(!dlq.is_unresolved());
        assert_eq!(dlq.resolved_by.as_deref(), Some("retry-worker"));
    }
}
