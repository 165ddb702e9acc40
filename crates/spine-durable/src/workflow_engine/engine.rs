//! The workflow engine (spec.md §4.9): executes a [`Workflow`]'s DAG against
//! a [`WorkflowContext`], respecting each step's [`ExecutionPolicy`] and
//! [`OnError`] policy, and records `STEP_*` events on the durable ledger.
//!
//! Grounded in the teacher's `workflow::WorkflowExecutor` replay-driven shape
//! (context threaded step to step, lifecycle events recorded alongside
//! execution rather than after the fact), generalized from the teacher's
//! single linear replay log to the spec's DAG-with-waves model.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::dag::{topological_order, DagError};
use crate::errors::{ErrorCategory, SpineError};
use crate::ledger::{Ledger, LedgerError};
use crate::model::{EventType, ExecutionPolicy, OnError, Step, StepType, Workflow, WorkflowContext};
use crate::registry::HandlerRegistry;

const ADAPTIVE_DEFAULT_CONCURRENCY: usize = 8;

pub type ChoicePredicate = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

pub type LambdaFuture = Pin<Box<dyn Future<Output = Result<Value, SpineError>> + Send>>;

pub type LambdaHandler = Arc<dyn Fn(WorkflowContext) -> LambdaFuture + Send + Sync>;

/// Per-workflow-run registrations for step kinds the handler registry can't
/// express: in-process closures ([`StepType::Lambda`]) and branch predicates
/// ([`StepType::Choice`]), both keyed by step name.
#[derive(Default, Clone)]
pub struct StepHandlers {
    lambdas: HashMap<String, LambdaHandler>,
    predicates: HashMap<String, ChoicePredicate>,
}

impl StepHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lambda<F, Fut>(mut self, step_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SpineError>> + Send + 'static,
    {
        self.lambdas.insert(step_name.into(), Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn with_predicate<F>(mut self, step_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(step_name.into(), Arc::new(f));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowEngineError {
    #[error("invalid workflow graph: {0}")]
    Dag(#[from] DagError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("step {0:?} has type choice but no predicate was registered for it")]
    MissingPredicate(String),
}

/// The terminal disposition of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub outcome: StepOutcome,
    pub error: Option<SpineError>,
}

/// The terminal disposition of a workflow run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    /// Every step ran to a terminal outcome, but at least one `on_error:
    /// continue` step failed and its dependents were cascade-skipped
    /// (spec.md §4.9.4).
    FailedPartial,
    Failed,
    DeadLettered,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    pub context: WorkflowContext,
    pub steps: Vec<StepRecord>,
    pub failed_step: Option<String>,
    pub error: Option<SpineError>,
}

/// Executes a [`Workflow`]'s DAG, one run at a time, against a shared
/// [`HandlerRegistry`] for `Operation`/`Map` steps.
pub struct WorkflowEngine {
    ledger: Arc<dyn Ledger>,
    registry: Arc<HandlerRegistry>,
}

impl WorkflowEngine {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<HandlerRegistry>) -> Self {
        Self { ledger, registry }
    }

    pub async fn execute(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        ctx: WorkflowContext,
        handlers: &StepHandlers,
    ) -> Result<WorkflowResult, WorkflowEngineError> {
        self.execute_resumable(workflow, run_id, ctx, handlers, &HashSet::new()).await
    }

    /// Like [`Self::execute`], but steps named in `already_done` are treated
    /// as having already completed on a prior attempt: they are neither
    /// invoked nor recorded, but their dependents still run normally. Used
    /// by [`super::tracked::TrackedRunner`] to resume a workflow from its
    /// manifest stages after a crash (spec.md §4.10).
    pub async fn execute_resumable(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        mut ctx: WorkflowContext,
        handlers: &StepHandlers,
        already_done: &HashSet<String>,
    ) -> Result<WorkflowResult, WorkflowEngineError> {
        let waves = topological_order(workflow)?;
        let mut skip_set: HashSet<String> = HashSet::new();
        let mut records = Vec::new();

        for wave in waves {
            let runnable: Vec<&Step> = wave
                .iter()
                .filter_map(|name| workflow.step(name))
                .filter(|step| !already_done.contains(&step.name))
                .collect();

            match workflow.execution_policy {
                ExecutionPolicy::Sequential => {
                    for step in runnable {
                        match self.run_one(step, &mut ctx, handlers, &mut skip_set).await? {
                            StepRunOutcome::Recorded(outcome) => {
                                records.push(StepRecord {
                                    name: step.name.clone(),
                                    outcome,
                                    error: None,
                                });
                            }
                            StepRunOutcome::Halt(result) => {
                                records.push(StepRecord {
                                    name: step.name.clone(),
                                    outcome: StepOutcome::Failed,
                                    error: result.error.clone(),
                                });
                                return Ok(WorkflowResult { steps: records, ..result });
                            }
                        }
                    }
                }
                ExecutionPolicy::Parallel { max_concurrency } => {
                    if let Some(result) = self
                        .run_wave_concurrently(runnable, &mut ctx, handlers, &mut skip_set, &mut records, max_concurrency.max(1))
                        .await?
                    {
                        return Ok(result);
                    }
                }
                ExecutionPolicy::Adaptive => {
                    if let Some(result) = self
                        .run_wave_concurrently(
                            runnable,
                            &mut ctx,
                            handlers,
                            &mut skip_set,
                            &mut records,
                            ADAPTIVE_DEFAULT_CONCURRENCY,
                        )
                        .await?
                    {
                        return Ok(result);
                    }
                }
            }
        }

        let status = if records.iter().any(|r| r.outcome == StepOutcome::Failed) {
            WorkflowStatus::FailedPartial
        } else {
            WorkflowStatus::Completed
        };

        Ok(WorkflowResult {
            status,
            context: ctx,
            steps: records,
            failed_step: None,
            error: None,
        })
    }

    /// Run a wave's steps concurrently, bounded by `max_concurrency`. Each
    /// step still receives the context as it stood before the wave began —
    /// concurrent siblings cannot observe each other's outputs, matching
    /// `WorkflowContext`'s per-call immutability.
    async fn run_wave_concurrently(
        &self,
        runnable: Vec<&Step>,
        ctx: &mut WorkflowContext,
        handlers: &StepHandlers,
        skip_set: &mut HashSet<String>,
        records: &mut Vec<StepRecord>,
        max_concurrency: usize,
    ) -> Result<Option<WorkflowResult>, WorkflowEngineError> {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let base = ctx.clone();
        let mut futures = Vec::new();

        for step in &runnable {
            if step.depends_on.iter().any(|d| skip_set.contains(d)) {
                skip_set.insert(step.name.clone());
                records.push(StepRecord {
                    name: step.name.clone(),
                    outcome: StepOutcome::Skipped,
                    error: None,
                });
                continue;
            }

            // Choice steps only evaluate a predicate and mark a skip; run
            // them inline rather than concurrently so `skip_set` is settled
            // before any sibling step that might depend on the branch runs.
            if let StepType::Choice { then_step, else_step } = &step.step_type {
                let predicate = handlers
                    .predicates
                    .get(&step.name)
                    .ok_or_else(|| WorkflowEngineError::MissingPredicate(step.name.clone()))?;
                let taken = predicate(ctx);
                let (chosen, other) = if taken {
                    (Some(then_step.clone()), else_step.clone())
                } else {
                    (else_step.clone(), Some(then_step.clone()))
                };
                if let Some(other) = other {
                    if Some(&other) != chosen.as_ref() {
                        skip_set.insert(other);
                    }
                }
                *ctx = ctx.with_output(step.name.clone(), serde_json::json!({"taken": taken}));
                records.push(StepRecord {
                    name: step.name.clone(),
                    outcome: StepOutcome::Completed,
                    error: None,
                });
                self.emit(ctx.run_id, EventType::StepCompleted, &step.name, Value::Null)
                    .await;
                continue;
            }

            let semaphore = semaphore.clone();
            let step = (*step).clone();
            let mut local_ctx = base.clone();
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                self.emit(local_ctx.run_id, EventType::StepStarted, &step.name, Value::Null)
                    .await;
                let outcome = self.execute_step_body(&step, &mut local_ctx, handlers).await;
                (step, local_ctx, outcome)
            });
        }

        let outcomes = futures::future::join_all(futures).await;

        for (step, _local_ctx, outcome) in outcomes {
            match outcome {
                Ok(output) => {
                    *ctx = ctx.with_output(step.name.clone(), output);
                    records.push(StepRecord {
                        name: step.name.clone(),
                        outcome: StepOutcome::Completed,
                        error: None,
                    });
                    self.emit(ctx.run_id, EventType::StepCompleted, &step.name, Value::Null)
                        .await;
                }
                Err(err) => {
                    records.push(StepRecord {
                        name: step.name.clone(),
                        outcome: StepOutcome::Failed,
                        error: Some(err.clone()),
                    });
                    self.emit(
                        ctx.run_id,
                        EventType::StepFailed,
                        &step.name,
                        serde_json::json!({"error": err.message}),
                    )
                    .await;
                    match step.on_error {
                        OnError::Continue => {
                            skip_set.insert(step.name.clone());
                        }
                        OnError::Stop => {
                            return Ok(Some(WorkflowResult {
                                status: WorkflowStatus::Failed,
                                context: ctx.clone(),
                                steps: records.clone(),
                                failed_step: Some(step.name.clone()),
                                error: Some(err),
                            }));
                        }
                        OnError::Dlq => {
                            return Ok(Some(WorkflowResult {
                                status: WorkflowStatus::DeadLettered,
                                context: ctx.clone(),
                                steps: records.clone(),
                                failed_step: Some(step.name.clone()),
                                error: Some(err),
                            }));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    /// Run a single step sequentially, updating `ctx` in place. Returns
    /// either the step's recorded outcome, or a terminal [`WorkflowResult`]
    /// when the step's `on_error` policy calls for halting the workflow.
    async fn run_one(
        &self,
        step: &Step,
        ctx: &mut WorkflowContext,
        handlers: &StepHandlers,
        skip_set: &mut HashSet<String>,
    ) -> Result<StepRunOutcome, WorkflowEngineError> {
        if step.depends_on.iter().any(|d| skip_set.contains(d)) {
            skip_set.insert(step.name.clone());
            return Ok(StepRunOutcome::Recorded(StepOutcome::Skipped));
        }

        if let StepType::Choice { then_step, else_step } = &step.step_type {
            let predicate = handlers
                .predicates
                .get(&step.name)
                .ok_or_else(|| WorkflowEngineError::MissingPredicate(step.name.clone()))?;
            let taken = predicate(ctx);
            let (chosen, other) = if taken {
                (Some(then_step.clone()), else_step.clone())
            } else {
                (else_step.clone(), Some(then_step.clone()))
            };
            if let Some(other) = other {
                if Some(&other) != chosen.as_ref() {
                    skip_set.insert(other);
                }
            }
            *ctx = ctx.with_output(step.name.clone(), serde_json::json!({"taken": taken}));
            self.emit(ctx.run_id, EventType::StepCompleted, &step.name, Value::Null)
                .await;
            return Ok(StepRunOutcome::Recorded(StepOutcome::Completed));
        }

        self.emit(ctx.run_id, EventType::StepStarted, &step.name, Value::Null).await;
        match self.execute_step_body(step, ctx, handlers).await {
            Ok(output) => {
                *ctx = ctx.with_output(step.name.clone(), output);
                self.emit(ctx.run_id, EventType::StepCompleted, &step.name, Value::Null)
                    .await;
                Ok(StepRunOutcome::Recorded(StepOutcome::Completed))
            }
            Err(err) => {
                self.emit(
                    ctx.run_id,
                    EventType::StepFailed,
                    &step.name,
                    serde_json::json!({"error": err.message}),
                )
                .await;
                match step.on_error {
                    OnError::Continue => {
                        skip_set.insert(step.name.clone());
                        Ok(StepRunOutcome::Recorded(StepOutcome::Failed))
                    }
                    OnError::Stop => Ok(StepRunOutcome::Halt(WorkflowResult {
                        status: WorkflowStatus::Failed,
                        context: ctx.clone(),
                        steps: Vec::new(),
                        failed_step: Some(step.name.clone()),
                        error: Some(err),
                    })),
                    OnError::Dlq => Ok(StepRunOutcome::Halt(WorkflowResult {
                        status: WorkflowStatus::DeadLettered,
                        context: ctx.clone(),
                        steps: Vec::new(),
                        failed_step: Some(step.name.clone()),
                        error: Some(err),
                    })),
                }
            }
        }
    }

    async fn execute_step_body(
        &self,
        step: &Step,
        ctx: &mut WorkflowContext,
        handlers: &StepHandlers,
    ) -> Result<Value, SpineError> {
        match &step.step_type {
            StepType::Operation { operation_name } => {
                let handler = self
                    .registry
                    .get(crate::model::WorkKind::Step, operation_name)
                    .map_err(|e| SpineError::new(ErrorCategory::Orchestration, e.to_string()))?;
                let input = serde_json::json!({
                    "params": ctx.params,
                    "outputs": ctx.outputs,
                    "config": step.config,
                });
                handler(input).await
            }
            StepType::Lambda => {
                let lambda = handlers
                    .lambdas
                    .get(&step.name)
                    .cloned()
                    .ok_or_else(|| {
                        SpineError::new(
                            ErrorCategory::Orchestration,
                            format!("no lambda registered for step {:?}", step.name),
                        )
                    })?;
                lambda(ctx.clone()).await
            }
            StepType::Choice { .. } => unreachable!("choice steps are handled in run_one"),
            StepType::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                Ok(serde_json::json!({"waited_seconds": seconds}))
            }
            StepType::Map {
                items_from,
                max_concurrency,
                operation_name,
            } => {
                let items = resolve_path(ctx, items_from)
                    .and_then(|v| v.as_array().cloned())
                    .ok_or_else(|| {
                        SpineError::new(
                            ErrorCategory::Validation,
                            format!("{items_from:?} did not resolve to an array"),
                        )
                    })?;

                let handler = self
                    .registry
                    .get(crate::model::WorkKind::Step, operation_name)
                    .map_err(|e| SpineError::new(ErrorCategory::Orchestration, e.to_string()))?;

                let semaphore = Arc::new(Semaphore::new((*max_concurrency).max(1)));
                let mut futures = Vec::new();
                for (index, item) in items.into_iter().enumerate() {
                    let handler = handler.clone();
                    let semaphore = semaphore.clone();
                    futures.push(async move {
                        let _permit = semaphore.acquire().await.expect("semaphore not closed");
                        let input = serde_json::json!({"item": item, "index": index});
                        handler(input).await
                    });
                }

                // join_all polls every future concurrently (bounded by the
                // semaphore above); awaiting futures one at a time here
                // would serialize them behind each permit in turn and make
                // `max_concurrency` a no-op.
                let results = futures::future::join_all(futures).await;
                let mut outputs = Vec::with_capacity(results.len());
                for result in results {
                    outputs.push(result?);
                }
                Ok(Value::Array(outputs))
            }
        }
    }

    async fn emit(&self, run_id: Uuid, event_type: EventType, step_name: &str, mut payload: Value) {
        if let Value::Object(ref mut map) = payload {
            map.insert("step".into(), Value::String(step_name.to_string()));
        } else {
            payload = serde_json::json!({"step": step_name});
        }
        let _ = self.ledger.record_event(run_id, event_type, payload).await;
    }
}

/// The result of running a single step in [`ExecutionPolicy::Sequential`]
/// mode: either its recorded outcome, or a signal to halt the workflow.
enum StepRunOutcome {
    Recorded(StepOutcome),
    Halt(WorkflowResult),
}

/// Resolve a dotted path (`"params.symbols"`, `"outputs.extract.rows"`) into
/// the context's merged params/outputs view.
fn resolve_path(ctx: &WorkflowContext, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let root = parts.next()?;
    let mut current = match root {
        "params" => ctx.params.clone(),
        "outputs" => serde_json::to_value(&ctx.outputs).ok()?,
        "metadata" => Value::Object(ctx.metadata.clone()),
        other => ctx.outputs.get(other).cloned()?,
    };
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}
