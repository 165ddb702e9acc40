//! Manifest stages: idempotency markers for the [`crate::workflow_engine::tracked`] runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single recorded milestone for a partition. Stages are `STARTED`,
/// `STEP_<name>` for each workflow step, and `COMPLETED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStage {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub recorded_at: DateTime<Utc>,
}

/// The fixed stage name marking full completion of a partition.
pub const COMPLETED_STAGE: &str = "COMPLETED";

/// The fixed stage name marking the workflow's start for a partition.
pub const STARTED_STAGE: &str = "STARTED";

/// The stage name for an individual step.
pub fn step_stage(step_name: &str) -> String {
    format!("STEP_{step_name}")
}

/// Canonicalize an arbitrary JSON partition key into a stable string for use
/// as a manifest/lock primary key component. Object keys are sorted so
/// `{"a":1,"b":2}` and `{"b":2,"a":1}` canonicalize identically.
pub fn canonical_partition_key(value: &Value) -> String {
    fn canon(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: std::collections::BTreeMap<String, Value> =
                    std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), canon(v));
                }
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(canon).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&canon(value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_partition_key_is_order_independent() {
        let a = canonical_partition_key(&json!({"symbol": "MSFT", "date": "2026-07-28"}));
        let b = canonical_partition_key(&json!({"date": "2026-07-28", "symbol": "MSFT"}));
        assert_eq!(a, b);
    }

    #[test]
    fn step_stage_names_are_prefixed() {
        assert_eq!(step_stage("extract"), "STEP_extract");
    }
}
