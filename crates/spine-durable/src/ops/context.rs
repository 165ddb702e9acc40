//! [`OpsContext`]: the caller identity and `dry_run` flag every ops-layer
//! operation takes (spec.md §4.14). The original source threads a database
//! connection through this context too; in the port the connection lives
//! inside [`crate::dispatcher::Dispatcher`]'s `Arc<dyn Ledger>` instead, so
//! `OpsContext` carries only what's genuinely per-call.

/// Per-call context: who's calling, and whether this call should actually
/// mutate state.
#[derive(Debug, Clone, Default)]
pub struct OpsContext {
    pub caller: Option<String>,
    pub dry_run: bool,
}

impl OpsContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: Some(caller.into()),
            dry_run: false,
        }
    }

    /// A context with no caller identity, for internal/system-initiated
    /// calls (the scheduler, the worker loop's own retries).
    pub fn system() -> Self {
        Self::default()
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
