//! A `dashmap`-backed [`Ledger`], for unit tests of components that only
//! need a `Ledger` and shouldn't spin up a database. Mirrors the teacher's
//! `InMemoryWorkflowEventStore` shape and semantics.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{Ledger, LedgerError, RunFilters};
use crate::errors::SpineError;
use crate::model::{
    is_allowed_transition, source_states_for, Event, EventType, RunRecord, RunStatus,
};

#[derive(Default)]
pub struct InMemoryLedger {
    runs: DashMap<Uuid, RunRecord>,
    events: DashMap<Uuid, Vec<Event>>,
    idempotency_index: DashMap<String, Uuid>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_run(&self, run: &RunRecord) -> Result<(), LedgerError> {
        if let Some(key) = &run.spec.idempotency_key {
            self.idempotency_index
                .entry(key.clone())
                .or_insert(run.run_id);
        }
        self.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError> {
        self.runs
            .get(&run_id)
            .map(|r| r.clone())
            .ok_or(LedgerError::RunNotFound(run_id))
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<Value>,
        error: Option<&SpineError>,
    ) -> Result<(), LedgerError> {
        let mut entry = self
            .runs
            .get_mut(&run_id)
            .ok_or(LedgerError::RunNotFound(run_id))?;

        if !is_allowed_transition(entry.status, status) {
            return Err(LedgerError::InvalidTransition {
                from: entry.status,
                to: status,
            });
        }

        let sources = source_states_for(status);
        if !sources.contains(&entry.status) {
            return Err(LedgerError::ConcurrencyConflict {
                run_id,
                expected: sources.to_vec(),
            });
        }

        match status {
            RunStatus::Queued => entry.mark_queued(),
            RunStatus::Running => entry.mark_running(),
            RunStatus::Completed => entry.mark_completed(result.unwrap_or(Value::Null)),
            RunStatus::Failed => {
                let err = error
                    .cloned()
                    .unwrap_or_else(|| SpineError::internal("unknown failure"));
                entry.mark_failed(&err);
            }
            RunStatus::Cancelled => entry.mark_cancelled(),
            RunStatus::TimedOut => entry.mark_timed_out(),
            RunStatus::Pending => {}
        }
        Ok(())
    }

    async fn record_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
    ) -> Result<Event, LedgerError> {
        let event = Event::new(run_id, event_type, payload);
        self.events.entry(run_id).or_default().push(event.clone());
        Ok(event)
    }

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<Event>, LedgerError> {
        Ok(self.events.get(&run_id).map(|e| e.clone()).unwrap_or_default())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>, LedgerError> {
        let Some(run_id) = self.idempotency_index.get(key).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.runs.get(&run_id).map(|r| r.clone()))
    }

    async fn list_runs(
        &self,
        filters: RunFilters,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>, LedgerError> {
        let mut matched: Vec<RunRecord> = self
            .runs
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|r| filters.status.map(|s| s == r.status).unwrap_or(true))
            .filter(|r| {
                filters
                    .name
                    .as_ref()
                    .map(|n| n == &r.spec.name)
                    .unwrap_or(true)
            })
            .filter(|r| {
                filters
                    .parent_run_id
                    .map(|p| Some(p) == r.parent_run_id)
                    .unwrap_or(true)
            })
            .collect();
        matched.sort_by_key(|r| r.created_at);
        Ok(matched
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn get_children(&self, parent_run_id: Uuid) -> Result<Vec<RunRecord>, LedgerError> {
        let mut children: Vec<RunRecord> = self
            .runs
            .iter()
            .map(|e| e.value().clone())
            .filter(|r| r.parent_run_id == Some(parent_run_id))
            .collect();
        children.sort_by_key(|r| r.created_at);
        Ok(children)
    }
}
