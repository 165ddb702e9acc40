//! The Workflow Engine (spec.md §4.9) and its idempotent wrapper, the
//! Tracked Runner (spec.md §4.10).

pub mod dag;
pub mod engine;
pub mod tracked;

pub use dag::{topological_order, DagError};
pub use engine::{
    ChoicePredicate, LambdaHandler, StepHandlers, StepOutcome, StepRecord, WorkflowEngine,
    WorkflowEngineError, WorkflowResult, WorkflowStatus,
};
pub use tracked::{TrackedRunner, TrackedRunnerError};
