//! Remote runtime adapter (spec.md §4.5): submits to an external container
//! scheduler (Docker/K8s/etc.) via a narrow adapter protocol, with
//! pre-submit validation of capabilities, resource limits, and budget caps.
//! The adapter router picks an adapter by explicit spec metadata (`adapter`)
//! or falls back to a configured default.
//!
//! Grounded in the same `Executor` submit/cancel/status shape as
//! [`super::in_memory::InMemoryExecutor`] and [`super::thread_pool::ThreadPoolExecutor`];
//! the `RemoteAdapter` trait it wraps mirrors the teacher's `Executor` trait
//! one level down, generalized per §4.5's "adapter protocol" language since
//! the teacher itself has no remote-runtime concept to lift directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Executor, ExecutorError};
use crate::errors::{ErrorCategory, SpineError};
use crate::ledger::Ledger;
use crate::model::{EventType, RunStatus, WorkSpec};

/// Resource and capability constraints validated before a spec is handed to
/// an adapter. Adapters may also enforce their own backend-specific limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionLimits {
    pub max_cpu_millis: Option<u64>,
    pub max_memory_mb: Option<u64>,
    pub max_budget_cents: Option<u64>,
    pub allowed_capabilities: Vec<String>,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_cpu_millis: None,
            max_memory_mb: None,
            max_budget_cents: None,
            allowed_capabilities: Vec::new(),
        }
    }
}

impl SubmissionLimits {
    /// Validate `spec.metadata`'s `resources`/`capabilities` keys (if
    /// present) against this limit set. Absent keys pass trivially — limits
    /// are an upper bound, not a requirement to declare resources at all.
    pub fn validate(&self, spec: &WorkSpec) -> Result<(), SpineError> {
        if let Some(requested) = spec.metadata.get("cpu_millis").and_then(Value::as_u64) {
            if let Some(max) = self.max_cpu_millis {
                if requested > max {
                    return Err(SpineError::new(
                        ErrorCategory::Validation,
                        format!("requested cpu_millis {requested} exceeds limit {max}"),
                    ));
                }
            }
        }
        if let Some(requested) = spec.metadata.get("memory_mb").and_then(Value::as_u64) {
            if let Some(max) = self.max_memory_mb {
                if requested > max {
                    return Err(SpineError::new(
                        ErrorCategory::Validation,
                        format!("requested memory_mb {requested} exceeds limit {max}"),
                    ));
                }
            }
        }
        if let Some(requested) = spec.metadata.get("budget_cents").and_then(Value::as_u64) {
            if let Some(max) = self.max_budget_cents {
                if requested > max {
                    return Err(SpineError::new(
                        ErrorCategory::Validation,
                        format!("requested budget_cents {requested} exceeds limit {max}"),
                    ));
                }
            }
        }
        if !self.allowed_capabilities.is_empty() {
            if let Some(caps) = spec.metadata.get("capabilities").and_then(Value::as_array) {
                for cap in caps {
                    let cap = cap.as_str().unwrap_or_default();
                    if !self.allowed_capabilities.iter().any(|c| c == cap) {
                        return Err(SpineError::new(
                            ErrorCategory::Validation,
                            format!("capability {cap:?} is not permitted for this adapter"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A backend-specific container/job scheduler. Implementations talk to the
/// actual remote system (Docker, Kubernetes, Nomad, ...); `spine-durable`
/// ships only [`NullRemoteAdapter`], a deterministic stand-in for tests and
/// for wiring the dispatcher before a real backend is configured.
#[async_trait]
pub trait RemoteAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Submit `spec` for execution; returns the backend's own identifier for
    /// the job (container id, pod name, ...).
    async fn submit(&self, run_id: Uuid, spec: &WorkSpec) -> Result<String, SpineError>;

    async fn cancel(&self, external_ref: &str) -> Result<bool, SpineError>;

    async fn poll_status(&self, external_ref: &str) -> Result<Option<RunStatus>, SpineError>;
}

/// A deterministic adapter that completes every submission immediately with
/// an empty result. Useful for integration tests of the dispatcher/executor
/// wiring without standing up a real container scheduler.
pub struct NullRemoteAdapter {
    name: &'static str,
}

impl NullRemoteAdapter {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Default for NullRemoteAdapter {
    fn default() -> Self {
        Self::new("null")
    }
}

#[async_trait]
impl RemoteAdapter for NullRemoteAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn submit(&self, run_id: Uuid, _spec: &WorkSpec) -> Result<String, SpineError> {
        Ok(format!("null-job-{run_id}"))
    }

    async fn cancel(&self, _external_ref: &str) -> Result<bool, SpineError> {
        Ok(true)
    }

    async fn poll_status(&self, _external_ref: &str) -> Result<Option<RunStatus>, SpineError> {
        Ok(Some(RunStatus::Completed))
    }
}

/// Routes a `WorkSpec` to one of several registered [`RemoteAdapter`]s by its
/// `metadata["adapter"]` key, falling back to a configured default, validates
/// resource/capability limits before submission, and updates the
/// `RunRecord` through the ledger exactly like the other executor
/// strategies.
pub struct RemoteExecutor {
    ledger: Arc<dyn Ledger>,
    adapters: HashMap<&'static str, Arc<dyn RemoteAdapter>>,
    default_adapter: &'static str,
    limits: SubmissionLimits,
}

impl RemoteExecutor {
    pub fn new(ledger: Arc<dyn Ledger>, default: Arc<dyn RemoteAdapter>) -> Self {
        let default_adapter = default.name();
        let mut adapters: HashMap<&'static str, Arc<dyn RemoteAdapter>> = HashMap::new();
        adapters.insert(default_adapter, default);
        Self {
            ledger,
            adapters,
            default_adapter,
            limits: SubmissionLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SubmissionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn register_adapter(mut self, adapter: Arc<dyn RemoteAdapter>) -> Self {
        self.adapters.insert(adapter.name(), adapter);
        self
    }

    fn resolve_adapter(&self, spec: &WorkSpec) -> Result<&Arc<dyn RemoteAdapter>, ExecutorError> {
        let name = spec
            .metadata
            .get("adapter")
            .and_then(Value::as_str)
            .unwrap_or(self.default_adapter);
        self.adapters
            .get(name)
            .ok_or_else(|| ExecutorError::AdapterNotFound(name.to_string()))
    }
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn submit(&self, run_id: Uuid, spec: &WorkSpec) -> Result<String, ExecutorError> {
        let adapter = self.resolve_adapter(spec)?;

        if let Err(err) = self.limits.validate(spec) {
            self.ledger
                .update_status(run_id, RunStatus::Failed, None, Some(&err))
                .await?;
            return Err(ExecutorError::RemoteRejected(err.message));
        }

        self.ledger
            .update_status(run_id, RunStatus::Queued, None, None)
            .await?;

        match adapter.submit(run_id, spec).await {
            Ok(external_ref) => Ok(external_ref),
            Err(err) => {
                self.ledger
                    .update_status(run_id, RunStatus::Failed, None, Some(&err))
                    .await?;
                Err(ExecutorError::RemoteRejected(err.message))
            }
        }
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError> {
        for adapter in self.adapters.values() {
            if let Ok(true) = adapter.cancel(external_ref).await {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get_status(&self, external_ref: &str) -> Result<Option<RunStatus>, ExecutorError> {
        for adapter in self.adapters.values() {
            if let Ok(Some(status)) = adapter.poll_status(external_ref).await {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }
}
