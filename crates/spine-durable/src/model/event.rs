//! [`Event`]: the durable record of a state transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type vocabulary (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Started,
    Completed,
    Failed,
    Cancelled,
    RetryScheduled,
    StepStarted,
    StepCompleted,
    StepFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepCompleted => "STEP_COMPLETED",
            Self::StepFailed => "STEP_FAILED",
        };
        write!(f, "{s}")
    }
}

/// A single recorded lifecycle transition for a run or execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn new(run_id: Uuid, event_type: EventType, payload: Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            run_id,
            event_type,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_displays_screaming_snake_case() {
        assert_eq!(EventType::StepFailed.to_string(), "STEP_FAILED");
        assert_eq!(EventType::Created.to_string(), "CREATED");
    }
}
