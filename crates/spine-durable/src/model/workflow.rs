//! [`Workflow`], [`Step`], and the immutable [`WorkflowContext`] they share.
//!
//! Grounded in the teacher's "value types... do not mutate in place"
//! translation of the original source's frozen-dataclass contexts (§9):
//! every mutator on `WorkflowContext` consumes `self` and returns a new
//! value rather than mutating through `&mut self`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How a step's failure affects the rest of the workflow (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Stop,
    Continue,
    Dlq,
}

/// The kind of work a [`Step`] performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    /// Invoke a registered handler by name.
    Operation { operation_name: String },
    /// Invoke an in-process closure registered against this step's name.
    Lambda,
    /// Branch to `then_step` or `else_step` depending on a predicate
    /// evaluated against the context (the predicate itself is supplied by
    /// the caller at registration time, keyed by step name).
    Choice {
        then_step: String,
        else_step: Option<String>,
    },
    /// Delay for `seconds` before completing.
    Wait { seconds: u64 },
    /// Fan out over the list produced by evaluating `items_from` (a dotted
    /// path into the context's params/outputs) with bounded concurrency.
    Map {
        items_from: String,
        max_concurrency: usize,
        operation_name: String,
    },
}

/// A node in a workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub step_type: StepType,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: Value,
    pub on_error: OnError,
    pub timeout: Option<std::time::Duration>,
}

impl Step {
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            depends_on: Vec::new(),
            config: Value::Object(serde_json::Map::new()),
            on_error: OnError::Stop,
            timeout: None,
        }
    }

    pub fn depends_on(mut self, steps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How ready steps are scheduled (spec.md §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    Sequential,
    Parallel { max_concurrency: usize },
    Adaptive,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self::Sequential
    }
}

/// An immutable workflow definition, registered once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
    pub execution_policy: ExecutionPolicy,
    pub domain: String,
    pub version: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub defaults: Value,
}

impl Workflow {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            execution_policy: ExecutionPolicy::default(),
            domain: domain.into(),
            version: "1".to_string(),
            description: None,
            tags: Vec::new(),
            defaults: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = policy;
        self
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Immutable, per-run workflow state threaded through every step (spec.md
/// §3). Mutation methods return a new `WorkflowContext`; the original is
/// left untouched, so a step that fans out (e.g. `map`) can hand each branch
/// its own context without the branches observing each other's outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub params: Value,
    pub partition: Option<Value>,
    pub outputs: BTreeMap<String, Value>,
    pub metadata: serde_json::Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub batch_id: Option<String>,
    pub execution_id: Uuid,
    pub dry_run: bool,
}

impl WorkflowContext {
    pub fn new(run_id: Uuid, workflow_name: impl Into<String>, params: Value) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            params,
            partition: None,
            outputs: BTreeMap::new(),
            metadata: serde_json::Map::new(),
            started_at: Utc::now(),
            batch_id: None,
            execution_id: run_id,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_partition(mut self, partition: Value) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Return a new context with `step_name`'s output recorded. Outputs
    /// accumulate across steps (spec.md §3).
    pub fn with_output(&self, step_name: impl Into<String>, output: Value) -> Self {
        let mut next = self.clone();
        next.outputs.insert(step_name.into(), output);
        next
    }

    /// Return a new context with `params` replaced wholesale.
    pub fn with_params(&self, params: Value) -> Self {
        let mut next = self.clone();
        next.params = params;
        next
    }

    /// Return a new context with `key` set in `metadata`.
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value.into());
        next
    }

    /// Look up a previously-recorded step output by name.
    pub fn output_of(&self, step_name: &str) -> Option<&Value> {
        self.outputs.get(step_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_output_does_not_mutate_original() {
        let ctx = WorkflowContext::new(Uuid::now_v7(), "ingest", Value::Null);
        let next = ctx.with_output("extract", serde_json::json!({"rows": 10}));
        assert!(ctx.output_of("extract").is_none());
        assert_eq!(next.output_of("extract").unwrap()["rows"], 10);
    }

    #[test]
    fn outputs_accumulate_across_steps() {
        let ctx = WorkflowContext::new(Uuid::now_v7(), "ingest", Value::Null);
        let after_extract = ctx.with_output("extract", serde_json::json!(1));
        let after_transform = after_extract.with_output("transform", serde_json::json!(2));
        assert_eq!(after_transform.output_of("extract").unwrap(), 1);
        assert_eq!(after_transform.output_of("transform").unwrap(), 2);
    }

    #[test]
    fn serializes_round_trip() {
        let ctx = WorkflowContext::new(Uuid::now_v7(), "ingest", serde_json::json!({"a": 1}))
            .with_output("s1", serde_json::json!("done"))
            .with_metadata("priority", "high");
        let json = serde_json::to_string(&ctx).unwrap();
        let back: WorkflowContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workflow_name, "ingest");
        assert_eq!(back.output_of("s1").unwrap(), "done");
        assert_eq!(back.metadata.get("priority").unwrap(), "high");
    }

    #[test]
    fn workflow_builder_looks_up_steps_by_name() {
        let wf = Workflow::new("daily_close", "finance")
            .with_step(Step::new(
                "extract",
                StepType::Operation {
                    operation_name: "extract_op".into(),
                },
            ))
            .with_step(
                Step::new(
                    "transform",
                    StepType::Operation {
                        operation_name: "transform_op".into(),
                    },
                )
                .depends_on(["extract"])
                .on_error(OnError::Stop),
            );
        assert!(wf.step("extract").is_some());
        assert_eq!(wf.step("transform").unwrap().depends_on, vec!["extract"]);
        assert!(wf.step("missing").is_none());
    }
}
