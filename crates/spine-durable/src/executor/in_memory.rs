//! In-memory executor (spec.md §4.5): invokes the handler synchronously on
//! the caller's task, returns once complete. `external_ref` is trivial — the
//! run's own id — since there is no separate process/container to track.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Executor, ExecutorError};
use crate::ledger::Ledger;
use crate::model::{EventType, RunStatus, WorkSpec};
use crate::registry::HandlerRegistry;
use crate::resilience::CircuitBreakerRegistry;

pub struct InMemoryExecutor {
    ledger: Arc<dyn Ledger>,
    registry: Arc<HandlerRegistry>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl InMemoryExecutor {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            ledger,
            registry,
            breakers: None,
        }
    }

    /// Guard every handler invocation with a per-`(kind, name)` circuit
    /// breaker: an open breaker rejects the submission before the handler
    /// runs at all.
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }
}

#[async_trait]
impl Executor for InMemoryExecutor {
    async fn submit(&self, run_id: Uuid, spec: &WorkSpec) -> Result<String, ExecutorError> {
        let handler = self
            .registry
            .get(spec.kind, &spec.name)
            .map_err(|e| ExecutorError::HandlerNotFound(e.name))?;

        let breaker_key = format!("{:?}:{}", spec.kind, spec.name);
        let breaker = self.breakers.as_ref().map(|registry| registry.get(&breaker_key));
        let permit = breaker.as_ref().map(|b| b.allow()).transpose()?;

        self.ledger
            .update_status(run_id, RunStatus::Running, None, None)
            .await?;
        self.ledger
            .record_event(run_id, EventType::Started, serde_json::json!({}))
            .await?;

        match handler(spec.params.clone()).await {
            Ok(result) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                self.ledger
                    .update_status(run_id, RunStatus::Completed, Some(result.clone()), None)
                    .await?;
                self.ledger
                    .record_event(run_id, EventType::Completed, result)
                    .await?;
            }
            Err(error) => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                self.ledger
                    .update_status(run_id, RunStatus::Failed, None, Some(&error))
                    .await?;
                self.ledger
                    .record_event(
                        run_id,
                        EventType::Failed,
                        serde_json::json!({"error": error.message}),
                    )
                    .await?;
                return Err(ExecutorError::HandlerFailed(error));
            }
        }

        Ok(run_id.to_string())
    }

    /// A synchronous, already-complete run has nothing left to cancel.
    async fn cancel(&self, _external_ref: &str) -> Result<bool, ExecutorError> {
        Ok(false)
    }

    async fn get_status(&self, external_ref: &str) -> Result<Option<RunStatus>, ExecutorError> {
        let Ok(run_id) = external_ref.parse::<Uuid>() else {
            return Ok(None);
        };
        match self.ledger.get_run(run_id).await {
            Ok(run) => Ok(Some(run.status)),
            Err(crate::ledger::LedgerError::RunNotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::model::{RunRecord, WorkKind};

    #[tokio::test]
    async fn submit_runs_the_handler_and_records_completion() {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                WorkKind::Task,
                "echo",
                |params: serde_json::Value| async move { Ok(params) },
                None,
                vec![],
            )
            .unwrap();

        let spec = WorkSpec::task("echo").with_params(serde_json::json!({"x": 1}));
        let run = RunRecord::new(spec.clone());
        ledger.create_run(&run).await.unwrap();

        let executor = InMemoryExecutor::new(ledger.clone(), registry);
        let external_ref = executor.submit(run.run_id, &spec).await.unwrap();
        assert_eq!(external_ref, run.run_id.to_string());

        let fetched = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert_eq!(fetched.result.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn submit_marks_failed_on_handler_error() {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                WorkKind::Task,
                "boom",
                |_: serde_json::Value| async move {
                    Err(crate::errors::SpineError::internal("kaboom"))
                },
                None,
                vec![],
            )
            .unwrap();

        let spec = WorkSpec::task("boom");
        let run = RunRecord::new(spec.clone());
        ledger.create_run(&run).await.unwrap();

        let executor = InMemoryExecutor::new(ledger.clone(), registry);
        assert!(executor.submit(run.run_id, &spec).await.is_err());

        let fetched = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn a_tripped_breaker_rejects_submissions_without_invoking_the_handler() {
        use crate::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};

        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let calls_clone = calls.clone();
        registry
            .register(
                WorkKind::Task,
                "boom",
                move |_: serde_json::Value| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Err(crate::errors::SpineError::internal("kaboom"))
                    }
                },
                None,
                vec![],
            )
            .unwrap();

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        let executor = InMemoryExecutor::new(ledger.clone(), registry).with_circuit_breakers(breakers);

        let spec = WorkSpec::task("boom");
        let first_run = RunRecord::new(spec.clone());
        ledger.create_run(&first_run).await.unwrap();
        assert!(executor.submit(first_run.run_id, &spec).await.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let second_run = RunRecord::new(spec.clone());
        ledger.create_run(&second_run).await.unwrap();
        let err = executor.submit(second_run.run_id, &spec).await.unwrap_err();
        assert!(matches!(err, ExecutorError::CircuitOpen(_)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
