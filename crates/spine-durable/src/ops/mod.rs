//! The Ops Layer (spec.md §4.14): a typed request/response facade over the
//! dispatcher and repositories. The HTTP/REST API, MCP tool adapter, and CLI
//! — none of which live in this crate (spec.md §1) — consume *only* this
//! module; they never touch [`crate::ledger::Ledger`] or the repository
//! traits directly.
//!
//! Grounded in the dispatcher's own `submit`/`cancel`/`retry` shape
//! (`crate::dispatcher::Dispatcher`), wrapped here in a uniform
//! `Context -> OperationResult<T>` calling convention so every external
//! surface gets the same error codes, pagination envelope, and `dry_run`
//! handling without re-implementing them.

mod context;
mod error_code;
mod result;

pub use context::OpsContext;
pub use error_code::OpsErrorCode;
pub use result::{OperationResult, Page};

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::ledger::RunFilters;
use crate::model::{Event, RunRecord, WorkSpec};

/// The facade itself: one [`Dispatcher`] behind a uniform request/response
/// contract. Stateless beyond the `Arc<Dispatcher>` it wraps — safe to
/// clone and share across API handler tasks.
#[derive(Clone)]
pub struct Ops {
    dispatcher: Arc<Dispatcher>,
}

impl Ops {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Submit a `WorkSpec`. `ctx.dry_run` short-circuits before the
    /// dispatcher is touched: validation still happens (via the registry
    /// check the dispatcher itself performs is skipped here since no run is
    /// created), but nothing is persisted.
    pub async fn submit(&self, ctx: &OpsContext, spec: WorkSpec) -> OperationResult<Uuid> {
        let started = Instant::now();
        if ctx.dry_run {
            return OperationResult::ok(Uuid::nil(), started.elapsed())
                .with_warning("dry_run: no run was created");
        }

        match self.dispatcher.submit(spec).await {
            Ok(outcome) => {
                let mut result = OperationResult::ok(outcome.run_id, started.elapsed());
                if outcome.deduplicated {
                    result = result.with_metadata("deduplicated", Value::Bool(true));
                }
                result
            }
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }

    pub async fn get_run(&self, _ctx: &OpsContext, run_id: Uuid) -> OperationResult<RunRecord> {
        let started = Instant::now();
        match self.dispatcher.get_run(run_id).await {
            Ok(run) => OperationResult::ok(run, started.elapsed()),
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }

    pub async fn list_runs(
        &self,
        _ctx: &OpsContext,
        filters: RunFilters,
        limit: u32,
        offset: u32,
    ) -> OperationResult<Page<RunRecord>> {
        let started = Instant::now();
        // over-fetch by one to cheaply derive has_more without a COUNT(*) query.
        match self.dispatcher.list_runs(filters, limit + 1, offset).await {
            Ok(mut runs) => {
                let has_more = runs.len() as u32 > limit;
                runs.truncate(limit as usize);
                let page = Page {
                    items: runs,
                    total: None,
                    limit,
                    offset,
                    has_more,
                };
                OperationResult::ok(page, started.elapsed())
            }
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }

    pub async fn get_events(&self, _ctx: &OpsContext, run_id: Uuid) -> OperationResult<Vec<Event>> {
        let started = Instant::now();
        match self.dispatcher.get_events(run_id).await {
            Ok(events) => OperationResult::ok(events, started.elapsed()),
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }

    pub async fn get_children(&self, _ctx: &OpsContext, parent_run_id: Uuid) -> OperationResult<Vec<RunRecord>> {
        let started = Instant::now();
        match self.dispatcher.get_children(parent_run_id).await {
            Ok(children) => OperationResult::ok(children, started.elapsed()),
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }

    pub async fn cancel(&self, ctx: &OpsContext, run_id: Uuid) -> OperationResult<()> {
        let started = Instant::now();
        if ctx.dry_run {
            return OperationResult::ok((), started.elapsed()).with_warning("dry_run: no run was cancelled");
        }
        match self.dispatcher.cancel(run_id).await {
            Ok(()) => OperationResult::ok((), started.elapsed()),
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }

    pub async fn retry(&self, ctx: &OpsContext, run_id: Uuid) -> OperationResult<Uuid> {
        let started = Instant::now();
        if ctx.dry_run {
            return OperationResult::ok(Uuid::nil(), started.elapsed()).with_warning("dry_run: no retry was submitted");
        }
        match self.dispatcher.retry(run_id).await {
            Ok(outcome) => OperationResult::ok(outcome.run_id, started.elapsed()),
            Err(err) => OperationResult::err(map_dispatch_error(&err), started.elapsed()),
        }
    }
}

/// Maps the dispatcher's internal error enum onto the ops layer's stable
/// error code vocabulary (spec.md §4.14), which the REST surface then maps
/// onto HTTP status per RFC 7807 (spec.md §7) — a mapping this crate does
/// not perform, since the REST surface is out of scope (spec.md §1).
fn map_dispatch_error(err: &DispatchError) -> (OpsErrorCode, String) {
    let code = match err {
        DispatchError::Validation(_) => OpsErrorCode::ValidationFailed,
        DispatchError::NotRetryable(_) => OpsErrorCode::NotCancellable,
        DispatchError::NotCancellable(_) => OpsErrorCode::NotCancellable,
        DispatchError::Ledger(crate::ledger::LedgerError::RunNotFound(_)) => OpsErrorCode::NotFound,
        DispatchError::Ledger(crate::ledger::LedgerError::ConcurrencyConflict { .. }) => OpsErrorCode::Conflict,
        DispatchError::Ledger(_) => OpsErrorCode::Unavailable,
        DispatchError::Executor(_) => OpsErrorCode::Internal,
    };
    (code, err.to_string())
}
