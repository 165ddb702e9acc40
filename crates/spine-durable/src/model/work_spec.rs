//! [`WorkSpec`]: the immutable request to perform work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of target a [`WorkSpec`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Task,
    Pipeline,
    Workflow,
    Step,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Task => "task",
            Self::Pipeline => "pipeline",
            Self::Workflow => "workflow",
            Self::Step => "step",
        };
        write!(f, "{s}")
    }
}

/// Where a `WorkSpec` originated, carried through to the `RunRecord` for
/// auditing and alert routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Api,
    Cli,
    Schedule,
    Webhook,
    Retry,
    Manual,
}

/// The declarative request to execute work, handed to the [`crate::dispatcher::Dispatcher`].
///
/// Immutable once constructed: builder methods consume and return `Self`
/// rather than mutating in place, per §9's "value types, not mutate in
/// place" guidance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: WorkKind,
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub idempotency_key: Option<String>,
    pub parent_run_id: Option<Uuid>,
    pub trigger_source: TriggerSource,
}

impl WorkSpec {
    pub fn new(kind: WorkKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            params: Value::Object(serde_json::Map::new()),
            metadata: serde_json::Map::new(),
            idempotency_key: None,
            parent_run_id: None,
            trigger_source: TriggerSource::Api,
        }
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self::new(WorkKind::Task, name)
    }

    pub fn pipeline(name: impl Into<String>) -> Self {
        Self::new(WorkKind::Pipeline, name)
    }

    pub fn workflow(name: impl Into<String>) -> Self {
        Self::new(WorkKind::Workflow, name)
    }

    pub fn step(name: impl Into<String>) -> Self {
        Self::new(WorkKind::Step, name)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent_run_id(mut self, parent: Uuid) -> Self {
        self.parent_run_id = Some(parent);
        self
    }

    pub fn with_trigger_source(mut self, source: TriggerSource) -> Self {
        self.trigger_source = source;
        self
    }

    /// `(kind, name)` — the key consulted in the handler registry.
    pub fn registry_key(&self) -> (WorkKind, &str) {
        (self.kind, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_immutable_per_step() {
        let spec = WorkSpec::task("finra.otc.ingest")
            .with_params(serde_json::json!({"symbol": "MSFT"}))
            .with_idempotency_key("ingest-2026-07-28");
        assert_eq!(spec.kind, WorkKind::Task);
        assert_eq!(spec.idempotency_key.as_deref(), Some("ingest-2026-07-28"));
    }

    #[test]
    fn serializes_with_snake_case_kind() {
        let spec = WorkSpec::workflow("daily_close");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "workflow");
        assert_eq!(json["trigger_source"], "api");
    }
}
