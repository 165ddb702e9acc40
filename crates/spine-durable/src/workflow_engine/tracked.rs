//! The tracked/idempotent runner (spec.md §4.10): wraps [`WorkflowEngine`]
//! with manifest-stage markers so the same logical partition (e.g. "close
//! 2026-07-28 for account ACME") is never fully reprocessed, even if the
//! triggering schedule or retry fires twice.
//!
//! Grounded in the teacher's replay-log "has this already happened"
//! idempotency check ahead of re-running a workflow, translated from the
//! teacher's event-sourced replay onto the spec's flat manifest-stage table.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::engine::{WorkflowEngine, WorkflowEngineError, WorkflowResult, WorkflowStatus};
use crate::model::manifest::{canonical_partition_key, step_stage, COMPLETED_STAGE, STARTED_STAGE};
use crate::model::{Workflow, WorkflowContext};
use crate::registry::HandlerRegistry;
use crate::repositories::{ManifestRepository, RepositoryError};

use super::engine::StepHandlers;

#[derive(Debug, thiserror::Error)]
pub enum TrackedRunnerError {
    #[error("manifest repository error: {0}")]
    Manifest(#[from] RepositoryError),

    #[error("workflow engine error: {0}")]
    Engine(#[from] WorkflowEngineError),
}

/// Wraps [`WorkflowEngine::execute`] with a manifest-stage idempotency gate:
/// a partition already marked [`COMPLETED_STAGE`] is never re-run. Steps
/// whose `STEP_<name>` stage is already recorded (from a prior attempt that
/// crashed mid-workflow) are skipped on the next call, so only the steps
/// that never finished actually run, per spec.md §4.10.
pub struct TrackedRunner {
    engine: WorkflowEngine,
    manifest: Arc<dyn ManifestRepository>,
}

impl TrackedRunner {
    pub fn new(
        ledger: Arc<dyn crate::ledger::Ledger>,
        registry: Arc<HandlerRegistry>,
        manifest: Arc<dyn ManifestRepository>,
    ) -> Self {
        Self {
            engine: WorkflowEngine::new(ledger, registry),
            manifest,
        }
    }

    /// Execute `workflow` for `run_id`, gated by the manifest stage for
    /// `ctx`'s partition. `partition_key` defaults to `ctx.partition` when
    /// set, falling back to `ctx.params` (canonicalized so key order never
    /// matters, spec.md §4.10).
    pub async fn execute(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        ctx: WorkflowContext,
        handlers: &StepHandlers,
    ) -> Result<WorkflowResult, TrackedRunnerError> {
        let domain = workflow.domain.as_str();
        let partition_source = ctx.partition.clone().unwrap_or_else(|| ctx.params.clone());
        let partition_key = canonical_partition_key(&partition_source);

        if self.manifest.has_stage(domain, &partition_key, COMPLETED_STAGE).await? {
            return Ok(WorkflowResult {
                status: WorkflowStatus::Completed,
                context: ctx,
                steps: Vec::new(),
                failed_step: None,
                error: None,
            });
        }

        if !self.manifest.has_stage(domain, &partition_key, STARTED_STAGE).await? {
            self.manifest.record_stage(domain, &partition_key, STARTED_STAGE).await?;
        }

        let mut already_done = HashSet::new();
        for step in &workflow.steps {
            if self
                .manifest
                .has_stage(domain, &partition_key, &step_stage(&step.name))
                .await?
            {
                already_done.insert(step.name.clone());
            }
        }

        let result = self
            .engine
            .execute_resumable(workflow, run_id, ctx, handlers, &already_done)
            .await?;

        for step in &result.steps {
            if step.outcome == super::engine::StepOutcome::Completed {
                self.manifest
                    .record_stage(domain, &partition_key, &step_stage(&step.name))
                    .await?;
            }
        }

        if result.status == WorkflowStatus::Completed {
            self.manifest.record_stage(domain, &partition_key, COMPLETED_STAGE).await?;
        }

        Ok(result)
    }

    /// Whether the given domain/partition has already completed, without
    /// running anything.
    pub async fn is_complete(&self, domain: &str, partition: &Value) -> Result<bool, TrackedRunnerError> {
        let key = canonical_partition_key(partition);
        Ok(self.manifest.has_stage(domain, &key, COMPLETED_STAGE).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::model::{Step, StepType};
    use crate::repositories::InMemoryRepositories;

    fn op(name: &str) -> StepType {
        StepType::Operation {
            operation_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn a_completed_partition_is_never_rerun() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manifest = Arc::new(InMemoryRepositories::new());
        let registry = HandlerRegistry::new();

        let calls = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let calls_clone = calls.clone();
        registry
            .register(
                crate::model::WorkKind::Step,
                "ingest_op",
                move |p: Value| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(p)
                    }
                },
                None,
                vec![],
            )
            .unwrap();
        let registry = Arc::new(registry);

        let runner = TrackedRunner::new(ledger, registry, manifest);
        let wf = Workflow::new("ingest", "finra").with_step(Step::new("ingest", op("ingest_op")));

        let partition = serde_json::json!({"symbol": "MSFT", "date": "2026-07-28"});
        let ctx = WorkflowContext::new(Uuid::now_v7(), "ingest", Value::Null).with_partition(partition.clone());

        let first = runner.execute(&wf, Uuid::now_v7(), ctx.clone(), &StepHandlers::new()).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Completed);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let second = runner.execute(&wf, Uuid::now_v7(), ctx, &StepHandlers::new()).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Completed);
        assert_eq!(second.steps.len(), 0);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_crash_mid_workflow_resumes_from_the_next_unrecorded_step() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manifest = Arc::new(InMemoryRepositories::new());
        let registry = HandlerRegistry::new();

        for name in ["step_1", "step_2", "step_3"] {
            registry
                .register(crate::model::WorkKind::Step, name, |p: Value| async move { Ok(p) }, None, vec![])
                .unwrap();
        }
        let registry = Arc::new(registry);
        let wf = Workflow::new("close", "finra")
            .with_step(Step::new("step_1", op("step_1")))
            .with_step(Step::new("step_2", op("step_2")).depends_on(["step_1"]))
            .with_step(Step::new("step_3", op("step_3")).depends_on(["step_2"]));

        let partition = serde_json::json!({"account": "ACME"});
        let key = canonical_partition_key(&partition);

        // Simulate a crash after step_2: manifest has STARTED, STEP_step_1,
        // STEP_step_2 but not STEP_step_3 or COMPLETED.
        manifest.record_stage("finra", &key, STARTED_STAGE).await.unwrap();
        manifest.record_stage("finra", &key, &step_stage("step_1")).await.unwrap();
        manifest.record_stage("finra", &key, &step_stage("step_2")).await.unwrap();

        let runner = TrackedRunner::new(ledger, registry, manifest);
        let ctx = WorkflowContext::new(Uuid::now_v7(), "close", Value::Null).with_partition(partition);

        let result = runner.execute(&wf, Uuid::now_v7(), ctx, &StepHandlers::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].name, "step_3");
        assert_eq!(result.steps[0].outcome, super::super::engine::StepOutcome::Completed);
    }

    #[tokio::test]
    async fn is_complete_reports_without_running() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manifest = Arc::new(InMemoryRepositories::new());
        let registry = Arc::new(HandlerRegistry::new());
        let runner = TrackedRunner::new(ledger, registry, manifest);

        let partition = serde_json::json!({"batch": 1});
        assert!(!runner.is_complete("finra", &partition).await.unwrap());
    }
}
