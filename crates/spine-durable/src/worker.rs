//! The Worker Loop (spec.md §4.8): polls the ledger for pending work, claims
//! it atomically, resolves a handler, executes it, and records the outcome.
//! Multiple workers may poll the same ledger safely — [`Ledger::claim_pending`]'s
//! conditional `UPDATE` prevents double-execution.
//!
//! Grounded in the teacher's `worker::pool::WorkerPool`: a `watch` channel
//! drives graceful shutdown, a bounded `Semaphore` caps in-process
//! parallelism, and a background poll loop is the only thing that calls into
//! the store — generalized here from activity-type routing to the spec's
//! ledger-polling claim model ([`Ledger::claim_pending`] stands in for the
//! teacher's `TaskPoller`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::errors::SpineError;
use crate::ledger::{Ledger, LedgerError};
use crate::model::{EventType, RunStatus};
use crate::registry::HandlerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("worker loop is already running")]
    AlreadyRunning,
}

/// Snapshot of the worker loop's lifetime counters (spec.md §4.8 step 5).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub uptime_seconds: f64,
}

struct Counters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

/// A long-running claim/execute loop over the durable ledger.
pub struct WorkerLoop {
    worker_id: String,
    ledger: Arc<dyn Ledger>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    started_at: std::sync::Mutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkerLoop {
    pub fn new(ledger: Arc<dyn Ledger>, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            ledger,
            registry,
            semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            counters: Arc::new(Counters::default()),
            started_at: std::sync::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            poll_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawn the background poll loop. Returns an error if already running.
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        {
            let mut started_at = self.started_at.lock().unwrap();
            if started_at.is_some() {
                return Err(WorkerError::AlreadyRunning);
            }
            *started_at = Some(Instant::now());
        }

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_poll_loop().await });
        *self.poll_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Signal the poll loop to stop accepting new batches and wait for
    /// in-flight handlers to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.poll_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        // Wait for in-flight handler invocations to release their permits.
        let _ = self
            .semaphore
            .acquire_many(self.config.max_workers as u32)
            .await;
    }

    pub fn stats(&self) -> WorkerStats {
        let uptime_seconds = self
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }

    async fn run_poll_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }

            match self
                .ledger
                .claim_pending(self.config.batch_size as u32, &self.worker_id)
                .await
            {
                Ok(claimed) => {
                    for run in claimed {
                        let this = self.clone();
                        let permit = match this.semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        tokio::spawn(async move {
                            let _permit = permit;
                            this.execute_claimed(run.run_id, run.spec.kind, &run.spec.name, run.spec.params).await;
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %err, "failed to claim pending runs");
                }
            }
        }
    }

    async fn execute_claimed(
        &self,
        run_id: Uuid,
        kind: crate::model::WorkKind,
        name: &str,
        params: serde_json::Value,
    ) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.ledger
            .record_event(run_id, EventType::Started, serde_json::json!({}))
            .await
            .ok();

        let outcome = match self.registry.get(kind, name) {
            Ok(handler) => handler(params).await,
            Err(err) => Err(SpineError::internal(err.to_string())),
        };

        match outcome {
            Ok(result) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self
                    .ledger
                    .update_status(run_id, RunStatus::Completed, Some(result.clone()), None)
                    .await
                {
                    tracing::error!(run_id = %run_id, error = %err, "failed to record completion");
                    return;
                }
                let _ = self.ledger.record_event(run_id, EventType::Completed, result).await;
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self
                    .ledger
                    .update_status(run_id, RunStatus::Failed, None, Some(&error))
                    .await
                {
                    tracing::error!(run_id = %run_id, error = %err, "failed to record failure");
                    return;
                }
                let _ = self
                    .ledger
                    .record_event(run_id, EventType::Failed, serde_json::json!({"error": error.message}))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::model::{RunRecord, WorkKind, WorkSpec};

    #[tokio::test]
    async fn claims_and_completes_a_pending_run() {
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
        let run = RunRecord::new(spec);
        ledger.create_run(&run).await.unwrap();

        let config = WorkerConfig {
            poll_interval: Duration::from_millis(5),
            batch_size: 10,
            max_workers: 2,
        };
        let worker = Arc::new(WorkerLoop::new(ledger.clone(), registry, config));
        worker.start().unwrap();

        for _ in 0..100 {
            if ledger.get_run(run.run_id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        worker.shutdown().await;

        let fetched = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert_eq!(worker.stats().completed, 1);
    }

    #[tokio::test]
    async fn two_workers_never_double_execute_the_same_run() {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();
        registry
            .register(
                WorkKind::Task,
                "count",
                move |_: serde_json::Value| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::Value::Null)
                    }
                },
                None,
                vec![],
            )
            .unwrap();

        let run = RunRecord::new(WorkSpec::task("count"));
        ledger.create_run(&run).await.unwrap();

        let config = WorkerConfig {
            poll_interval: Duration::from_millis(5),
            batch_size: 10,
            max_workers: 2,
        };
        let a = Arc::new(WorkerLoop::new(ledger.clone(), registry.clone(), config.clone()).with_worker_id("a"));
        let b = Arc::new(WorkerLoop::new(ledger.clone(), registry, config).with_worker_id("b"));
        a.start().unwrap();
        b.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        a.shutdown().await;
        b.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
