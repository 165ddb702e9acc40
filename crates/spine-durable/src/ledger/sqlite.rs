//! [`SqliteLedger`]: the `Ledger` backed by `sqlx::SqlitePool`.
//!
//! Grounded on the teacher's `persistence::postgres::PostgresWorkflowEventStore`
//! query-building idiom (`sqlx::query(...).bind(...).execute(&pool)`, errors
//! mapped through `map_err`), adapted to route all placeholder/timestamp text
//! through [`spine_dialect::Dialect`] instead of hard-coding `?`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use spine_dialect::{Dialect, SqliteDialect};

use super::{Ledger, LedgerError, RunFilters};
use crate::errors::SpineError;
use crate::model::{
    source_states_for, Event, EventType, RunRecord, RunStatus, TriggerSource, WorkKind, WorkSpec,
};

const DIALECT: SqliteDialect = SqliteDialect;

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }
}

fn work_kind_str(kind: WorkKind) -> &'static str {
    match kind {
        WorkKind::Task => "task",
        WorkKind::Pipeline => "pipeline",
        WorkKind::Workflow => "workflow",
        WorkKind::Step => "step",
    }
}

fn work_kind_from_str(s: &str) -> WorkKind {
    match s {
        "pipeline" => WorkKind::Pipeline,
        "workflow" => WorkKind::Workflow,
        "step" => WorkKind::Step,
        _ => WorkKind::Task,
    }
}

fn trigger_source_str(source: TriggerSource) -> &'static str {
    match source {
        TriggerSource::Api => "api",
        TriggerSource::Cli => "cli",
        TriggerSource::Schedule => "schedule",
        TriggerSource::Webhook => "webhook",
        TriggerSource::Retry => "retry",
        TriggerSource::Manual => "manual",
    }
}

fn trigger_source_from_str(s: &str) -> TriggerSource {
    match s {
        "cli" => TriggerSource::Cli,
        "schedule" => TriggerSource::Schedule,
        "webhook" => TriggerSource::Webhook,
        "retry" => TriggerSource::Retry,
        "manual" => TriggerSource::Manual,
        _ => TriggerSource::Api,
    }
}

fn row_to_run_record(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord, LedgerError> {
    let params_raw: String = row.try_get("params")?;
    let params: Value = serde_json::from_str(&params_raw)?;
    let result_raw: Option<String> = row.try_get("result")?;
    let result = result_raw
        .map(|s| serde_json::from_str(&s))
        .transpose()?;
    let status_raw: String = row.try_get("status")?;
    let status = RunStatus::from_db_str(&status_raw)
        .ok_or_else(|| LedgerError::Database(format!("unknown status: {status_raw}")))?;
    let kind_raw: String = row.try_get("lane")?;
    let trigger_raw: String = row.try_get("trigger_source")?;
    let idempotency_key: Option<String> = row.try_get("idempotency_key")?;
    let parent_execution_id: Option<String> = row.try_get("parent_execution_id")?;
    let retry_of_run_id: Option<String> = row.try_get("retry_of_run_id")?;

    let spec = WorkSpec {
        kind: work_kind_from_str(&kind_raw),
        name: row.try_get("workflow")?,
        params,
        metadata: serde_json::Map::new(),
        idempotency_key,
        parent_run_id: parent_execution_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| LedgerError::Database(e.to_string()))?,
        trigger_source: trigger_source_from_str(&trigger_raw),
    };

    let id_raw: String = row.try_get("id")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let started_at_raw: Option<String> = row.try_get("started_at")?;
    let completed_at_raw: Option<String> = row.try_get("completed_at")?;

    Ok(RunRecord {
        run_id: Uuid::parse_str(&id_raw).map_err(|e| LedgerError::Database(e.to_string()))?,
        spec,
        status,
        created_at: parse_timestamp(&created_at_raw)?,
        started_at: started_at_raw.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at_raw.as_deref().map(parse_timestamp).transpose()?,
        result,
        error: row.try_get("error")?,
        error_type: row.try_get("error_type")?,
        error_category: row.try_get("error_category")?,
        attempt: row.try_get::<i64, _>("retry_count")? as u32,
        retry_of_run_id: retry_of_run_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| LedgerError::Database(e.to_string()))?,
        parent_run_id: parent_execution_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| LedgerError::Database(e.to_string()))?,
        external_ref: row.try_get("external_ref")?,
    })
}

fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, LedgerError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| LedgerError::Database(format!("bad timestamp {raw}: {e}")))
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, LedgerError> {
    let data_raw: String = row.try_get("data")?;
    let payload: Value = serde_json::from_str(&data_raw)?;
    let event_type_raw: String = row.try_get("event_type")?;
    let event_type = event_type_from_db_str(&event_type_raw)
        .ok_or_else(|| LedgerError::Database(format!("unknown event type: {event_type_raw}")))?;
    let id_raw: String = row.try_get("id")?;
    let execution_id_raw: String = row.try_get("execution_id")?;
    let timestamp_raw: String = row.try_get("timestamp")?;
    Ok(Event {
        event_id: Uuid::parse_str(&id_raw).map_err(|e| LedgerError::Database(e.to_string()))?,
        run_id: Uuid::parse_str(&execution_id_raw)
            .map_err(|e| LedgerError::Database(e.to_string()))?,
        event_type,
        timestamp: parse_timestamp(&timestamp_raw)?,
        payload,
    })
}

fn event_type_db_str(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Created => "CREATED",
        EventType::Started => "STARTED",
        EventType::Completed => "COMPLETED",
        EventType::Failed => "FAILED",
        EventType::Cancelled => "CANCELLED",
        EventType::RetryScheduled => "RETRY_SCHEDULED",
        EventType::StepStarted => "STEP_STARTED",
        EventType::StepCompleted => "STEP_COMPLETED",
        EventType::StepFailed => "STEP_FAILED",
    }
}

fn event_type_from_db_str(s: &str) -> Option<EventType> {
    Some(match s {
        "CREATED" => EventType::Created,
        "STARTED" => EventType::Started,
        "COMPLETED" => EventType::Completed,
        "FAILED" => EventType::Failed,
        "CANCELLED" => EventType::Cancelled,
        "RETRY_SCHEDULED" => EventType::RetryScheduled,
        "STEP_STARTED" => EventType::StepStarted,
        "STEP_COMPLETED" => EventType::StepCompleted,
        "STEP_FAILED" => EventType::StepFailed,
        _ => return None,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn create_run(&self, run: &RunRecord) -> Result<(), LedgerError> {
        let params = serde_json::to_string(&run.spec.params)?;
        sqlx::query(
            r#"
            INSERT INTO core_executions
                (id, workflow, lane, params, status, trigger_source, parent_execution_id,
                 created_at, retry_count, retry_of_run_id, external_ref, idempotency_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.spec.name)
        .bind(work_kind_str(run.spec.kind))
        .bind(params)
        .bind(run.status.as_db_str())
        .bind(trigger_source_str(run.spec.trigger_source))
        .bind(run.parent_run_id.map(|id| id.to_string()))
        .bind(run.created_at.to_rfc3339())
        .bind(run.attempt as i64)
        .bind(run.retry_of_run_id.map(|id| id.to_string()))
        .bind(&run.external_ref)
        .bind(&run.spec.idempotency_key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to insert run");
            LedgerError::Database(e.to_string())
        })?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord, LedgerError> {
        let row = sqlx::query("SELECT * FROM core_executions WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::RunNotFound(run_id))?;
        row_to_run_record(&row)
    }

    async fn update_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        result: Option<Value>,
        error: Option<&SpineError>,
    ) -> Result<(), LedgerError> {
        let sources = source_states_for(status);
        if sources.is_empty() {
            return Err(LedgerError::InvalidTransition {
                from: status,
                to: status,
            });
        }
        let in_clause = DIALECT.placeholders(sources.len());

        let now = super::now_utc().to_rfc3339();
        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;

        let query_text = format!(
            r#"
            UPDATE core_executions
            SET status = ?,
                started_at = CASE WHEN ? = 'running' AND started_at IS NULL THEN ? ELSE started_at END,
                completed_at = CASE WHEN ? IN ('completed', 'failed', 'cancelled', 'timed_out') THEN ? ELSE completed_at END,
                result = COALESCE(?, result),
                error = COALESCE(?, error),
                error_type = COALESCE(?, error_type),
                error_category = COALESCE(?, error_category)
            WHERE id = ? AND status IN ({in_clause})
            "#
        );

        let status_str = status.as_db_str();
        let outcome = sqlx::query(&query_text)
            .bind(status_str)
            .bind(status_str)
            .bind(&now)
            .bind(status_str)
            .bind(&now)
            .bind(result_json)
            .bind(error.map(|e| e.message.clone()))
            .bind(error.map(|e| e.error_type().to_string()))
            .bind(error.map(|e| e.category.to_string()))
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;

        if outcome.rows_affected() == 0 {
            return Err(LedgerError::ConcurrencyConflict {
                run_id,
                expected: sources.to_vec(),
            });
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
        let data = serde_json::to_string(&event.payload)?;
        sqlx::query(
            "INSERT INTO core_execution_events (id, execution_id, event_type, timestamp, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.event_id.to_string())
        .bind(run_id.to_string())
        .bind(event_type_db_str(event_type))
        .bind(event.timestamp.to_rfc3339())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(event)
    }

    async fn get_events(&self, run_id: Uuid) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM core_execution_events WHERE execution_id = ? ORDER BY timestamp ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM core_executions WHERE idempotency_key = ? LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_run_record).transpose()
    }

    async fn list_runs(
        &self,
        filters: RunFilters,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RunRecord>, LedgerError> {
        let mut sql = String::from("SELECT * FROM core_executions WHERE 1 = 1");
        if filters.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filters.name.is_some() {
            sql.push_str(" AND workflow = ?");
        }
        if filters.parent_run_id.is_some() {
            sql.push_str(" AND parent_execution_id = ?");
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filters.status {
            query = query.bind(status.as_db_str());
        }
        if let Some(name) = &filters.name {
            query = query.bind(name.clone());
        }
        if let Some(parent) = filters.parent_run_id {
            query = query.bind(parent.to_string());
        }
        query = query.bind(limit as i64).bind(offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_run_record).collect()
    }

    async fn get_children(&self, parent_run_id: Uuid) -> Result<Vec<RunRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM core_executions WHERE parent_execution_id = ? ORDER BY created_at ASC",
        )
        .bind(parent_run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_ledger() -> SqliteLedger {
        let ledger = SqliteLedger::connect("sqlite::memory:").await.unwrap();
        ledger.run_migrations().await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let ledger = test_ledger().await;
        let run = RunRecord::new(WorkSpec::task("fetch_quote").with_params(serde_json::json!({"symbol": "MSFT"})));
        ledger.create_run(&run).await.unwrap();

        let fetched = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.run_id, run.run_id);
        assert_eq!(fetched.spec.params["symbol"], "MSFT");
        assert_eq!(fetched.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn update_status_enforces_source_states() {
        let ledger = test_ledger().await;
        let run = RunRecord::new(WorkSpec::task("x"));
        ledger.create_run(&run).await.unwrap();

        ledger
            .update_status(run.run_id, RunStatus::Running, None, None)
            .await
            .unwrap();
        ledger
            .update_status(run.run_id, RunStatus::Completed, Some(serde_json::json!({"ok": true})), None)
            .await
            .unwrap();

        let err = ledger
            .update_status(run.run_id, RunStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConcurrencyConflict { .. }));

        let fetched = ledger.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert_eq!(fetched.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn events_persist_in_order() {
        let ledger = test_ledger().await;
        let run = RunRecord::new(WorkSpec::task("x"));
        ledger.create_run(&run).await.unwrap();
        ledger
            .record_event(run.run_id, EventType::Created, serde_json::json!({}))
            .await
            .unwrap();
        ledger
            .record_event(run.run_id, EventType::Started, serde_json::json!({}))
            .await
            .unwrap();

        let events = ledger.get_events(run.run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Created);
        assert_eq!(events[1].event_type, EventType::Started);
    }

    #[tokio::test]
    async fn idempotency_key_resolves_to_same_run() {
        let ledger = test_ledger().await;
        let spec = WorkSpec::task("ingest").with_idempotency_key("2026-07-28");
        let run = RunRecord::new(spec);
        ledger.create_run(&run).await.unwrap();

        let found = ledger
            .get_by_idempotency_key("2026-07-28")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.run_id, run.run_id);
    }

    #[tokio::test]
    async fn list_runs_paginates() {
        let ledger = test_ledger().await;
        for _ in 0..5 {
            let run = RunRecord::new(WorkSpec::task("x"));
            ledger.create_run(&run).await.unwrap();
        }
        let page = ledger.list_runs(RunFilters::default(), 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
    }
}
