//! Executors (spec.md §4.5): pluggable run strategies behind one stable
//! interface. The dispatcher is executor-agnostic; each implementation owns
//! updating the `RunRecord` through the [`crate::ledger::Ledger`] at every
//! transition it drives.
//!
//! Grounded in the teacher's `worker::pool::WorkerPool` (bounded concurrency
//! via `tokio::sync::Semaphore`, `tokio::spawn` per task) for the thread-pool
//! strategy, and its `engine::executor` module for the general
//! submit/cancel/status shape — generalized here from a replay-driven
//! workflow executor to the spec's three-strategy surface.

mod in_memory;
mod remote;
mod thread_pool;

pub use in_memory::InMemoryExecutor;
pub use remote::{NullRemoteAdapter, RemoteAdapter, RemoteExecutor};
pub use thread_pool::ThreadPoolExecutor;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::SpineError;
use crate::model::{RunStatus, WorkSpec};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),

    #[error("no handler registered for {0:?}")]
    HandlerNotFound(String),

    #[error("handler failed: {0}")]
    HandlerFailed(#[from] SpineError),

    #[error("adapter {0:?} not found")]
    AdapterNotFound(String),

    #[error("remote submission rejected: {0}")]
    RemoteRejected(String),

    #[error("circuit breaker open: {0}")]
    CircuitOpen(#[from] crate::resilience::CircuitBreakerError),
}

/// A strategy for actually running a `WorkSpec` once the dispatcher has
/// created its `RunRecord`. `submit` returns an opaque `external_ref` the
/// dispatcher stores on the run and later passes back to `cancel`/`get_status`.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn submit(&self, run_id: Uuid, spec: &WorkSpec) -> Result<String, ExecutorError>;

    async fn cancel(&self, external_ref: &str) -> Result<bool, ExecutorError>;

    async fn get_status(&self, external_ref: &str) -> Result<Option<RunStatus>, ExecutorError>;
}
