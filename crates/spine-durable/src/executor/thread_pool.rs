//! Thread pool executor (spec.md §4.5): submits handler invocations to a
//! bounded pool rather than running them on the caller's own task.
//!
//! Grounded in the teacher's `worker::pool::WorkerPool` concurrency
//! discipline — a `tokio::sync::Semaphore` bounds in-flight work and each
//! accepted task runs on its own spawned task — narrowed here from a full
//! poll/heartbeat/reclaim worker down to just the `Executor` submit/cancel/
//! status surface; the durable claim loop itself lives in
//! [`crate::worker::WorkerLoop`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Executor, ExecutorError};
use crate::ledger::Ledger;
use crate::model::{EventType, RunStatus, WorkSpec};
use crate::registry::HandlerRegistry;

/// A `ThreadPoolExecutor`'s bookkeeping for one in-flight submission.
struct InFlight {
    handle: JoinHandle<()>,
}

/// Executes handlers on a bounded pool of spawned tasks. `external_ref` is
/// the run's own id (stringified) since there is no separate process to
/// track; `cancel` aborts the task's `JoinHandle` directly.
pub struct ThreadPoolExecutor {
    ledger: Arc<dyn Ledger>,
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

impl ThreadPoolExecutor {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<HandlerRegistry>, max_concurrency: usize) -> Self {
        Self {
            ledger,
            registry,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Number of permits currently in use.
    pub fn active_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[async_trait]
impl Executor for ThreadPoolExecutor {
    async fn submit(&self, run_id: Uuid, spec: &WorkSpec) -> Result<String, ExecutorError> {
        let handler = self
            .registry
            .get(spec.kind, &spec.name)
            .map_err(|e| ExecutorError::HandlerNotFound(e.name))?;

        self.ledger
            .update_status(run_id, RunStatus::Running, None, None)
            .await?;
        self.ledger
            .record_event(run_id, EventType::Started, serde_json::json!({}))
            .await?;

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        let ledger = self.ledger.clone();
        let params = spec.params.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            match handler(params).await {
                Ok(result) => {
                    if let Err(err) = ledger
                        .update_status(run_id, RunStatus::Completed, Some(result.clone()), None)
                        .await
                    {
                        tracing::error!(run_id = %run_id, error = %err, "failed to record completion");
                        return;
                    }
                    let _ = ledger
                        .record_event(run_id, EventType::Completed, result)
                        .await;
                }
                Err(error) => {
                    if let Err(err) = ledger
                        .update_status(run_id, RunStatus::Failed, None, Some(&error))
                        .await
                    {
                        tracing::error!(run_id = %run_id, error = %err, "failed to record failure");
                        return;
                    }
                    let _ = ledger
                        .record_event(
                            run_id,
                            EventType::Failed,
                            serde_json::json!({"error": error.message}),
                        )
                        .await;
                }
            }
        });

        self.in_flight.lock().insert(run_id, InFlight { handle });
        Ok(run_id.to_string())
    }

    /// Aborts the pooled task if still running. The ledger's state machine
    /// still governs the terminal status: if the task had already reached a
    /// terminal `update_status` call, the abort is a harmless no-op on an
    /// already-finished task.
    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError> {
        let Ok(run_id) = external_ref.parse::<Uuid>() else {
            return Ok(false);
        };
        let Some(in_flight) = self.in_flight.lock().remove(&run_id) else {
            return Ok(false);
        };
        in_flight.handle.abort();
        Ok(self
            .ledger
            .update_status(run_id, RunStatus::Cancelled, None, None)
            .await
            .is_ok())
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
    async fn submit_runs_on_the_pool_and_records_completion() {
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

        let executor = ThreadPoolExecutor::new(ledger.clone(), registry, 4);
        executor.submit(run.run_id, &spec).await.unwrap();

        // Wait for the spawned task to finish.
        for _ in 0..50 {
            if ledger.get_run(run.run_id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let fetched = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn bounded_pool_limits_concurrency() {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                WorkKind::Task,
                "slow",
                |_: serde_json::Value| async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(serde_json::Value::Null)
                },
                None,
                vec![],
            )
            .unwrap();

        let executor = Arc::new(ThreadPoolExecutor::new(ledger.clone(), registry, 2));
        for _ in 0..5 {
            let spec = WorkSpec::task("slow");
            let run = RunRecord::new(spec.clone());
            ledger.create_run(&run).await.unwrap();
            executor.submit(run.run_id, &spec).await.unwrap();
        }

        assert!(executor.active_count() <= 5);
    }
}
