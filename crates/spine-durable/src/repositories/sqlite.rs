//! SQLite implementations of the narrow repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use spine_dialect::{Dialect, SqliteDialect};

use super::{
    DlqRepository, LockRepository, ManifestRepository, RejectRepository, RepositoryError, ScheduleRepository,
};
use crate::model::{DeadLetter, Reject, Schedule, ScheduleTargetType, ScheduleTiming};

const DIALECT: SqliteDialect = SqliteDialect;

#[derive(Clone)]
pub struct SqliteRepositories {
    pool: SqlitePool,
}

impl SqliteRepositories {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn timing_to_columns(timing: &ScheduleTiming) -> (&'static str, Option<String>, Option<i64>) {
    match timing {
        ScheduleTiming::Cron(expr) => ("cron", Some(expr.clone()), None),
        ScheduleTiming::IntervalSeconds(secs) => ("interval", None, Some(*secs as i64)),
    }
}

fn columns_to_timing(
    schedule_type: &str,
    cron_expression: Option<String>,
    interval_seconds: Option<i64>,
) -> Result<ScheduleTiming, RepositoryError> {
    match schedule_type {
        "cron" => Ok(ScheduleTiming::Cron(cron_expression.ok_or_else(|| {
            RepositoryError::Database("cron schedule missing cron_expression".into())
        })?)),
        "interval" => Ok(ScheduleTiming::IntervalSeconds(
            interval_seconds.ok_or_else(|| {
                RepositoryError::Database("interval schedule missing interval_seconds".into())
            })? as u64,
        )),
        other => Err(RepositoryError::Database(format!(
            "unknown schedule_type: {other}"
        ))),
    }
}

fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> Result<Schedule, RepositoryError> {
    let id_raw: String = row.try_get("schedule_id")?;
    let target_type_raw: String = row.try_get("target_type")?;
    let schedule_type: String = row.try_get("schedule_type")?;
    let params_raw: String = row.try_get("params")?;
    let next_run_raw: Option<String> = row.try_get("next_run_at")?;
    let last_run_raw: Option<String> = row.try_get("last_run_at")?;
    let enabled: i64 = row.try_get("enabled")?;

    Ok(Schedule {
        schedule_id: Uuid::parse_str(&id_raw).map_err(|e| RepositoryError::Database(e.to_string()))?,
        name: row.try_get("name")?,
        target_type: if target_type_raw == "operation" {
            ScheduleTargetType::Operation
        } else {
            ScheduleTargetType::Workflow
        },
        target_name: row.try_get("target_name")?,
        timing: columns_to_timing(
            &schedule_type,
            row.try_get("cron_expression")?,
            row.try_get("interval_seconds")?,
        )?,
        enabled: enabled != 0,
        next_run_at: next_run_raw.map(|s| parse_ts(&s)).transpose()?,
        last_run_at: last_run_raw.map(|s| parse_ts(&s)).transpose()?,
        params: serde_json::from_str(&params_raw)?,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Database(format!("bad timestamp {raw}: {e}")))
}

#[async_trait]
impl ScheduleRepository for SqliteRepositories {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        let (schedule_type, cron_expression, interval_seconds) = timing_to_columns(&schedule.timing);
        let params = serde_json::to_string(&schedule.params)?;
        sqlx::query(
            r#"
            INSERT INTO core_schedules
                (schedule_id, name, target_type, target_name, schedule_type, cron_expression,
                 interval_seconds, enabled, next_run_at, last_run_at, params, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.schedule_id.to_string())
        .bind(&schedule.name)
        .bind(match schedule.target_type {
            ScheduleTargetType::Workflow => "workflow",
            ScheduleTargetType::Operation => "operation",
        })
        .bind(&schedule.target_name)
        .bind(schedule_type)
        .bind(cron_expression)
        .bind(interval_seconds)
        .bind(schedule.enabled as i64)
        .bind(schedule.next_run_at.map(|t| t.to_rfc3339()))
        .bind(schedule.last_run_at.map(|t| t.to_rfc3339()))
        .bind(params)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Schedule, RepositoryError> {
        let row = sqlx::query("SELECT * FROM core_schedules WHERE schedule_id = ?")
            .bind(schedule_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        row_to_schedule(&row)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM core_schedules WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM core_schedules WHERE enabled = 1 AND (next_run_at IS NULL OR next_run_at <= ?)",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn list_all(&self) -> Result<Vec<Schedule>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM core_schedules ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    async fn set_enabled(&self, schedule_id: Uuid, enabled: bool) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE core_schedules SET enabled = ? WHERE schedule_id = ?")
            .bind(enabled as i64)
            .bind(schedule_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_dispatch(
        &self,
        schedule_id: Uuid,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE core_schedules SET last_run_at = ?, next_run_at = ? WHERE schedule_id = ?")
            .bind(ran_at.to_rfc3339())
            .bind(next_run_at.to_rfc3339())
            .bind(schedule_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LockRepository for SqliteRepositories {
    async fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO core_schedule_locks (schedule_id, locked_by, locked_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (schedule_id) DO UPDATE SET
                locked_by = excluded.locked_by,
                locked_at = excluded.locked_at,
                expires_at = excluded.expires_at
            WHERE core_schedule_locks.expires_at < ?
            "#,
        )
        .bind(schedule_id.to_string())
        .bind(holder)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT locked_by FROM core_schedule_locks WHERE schedule_id = ?")
            .bind(schedule_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<String, _>("locked_by"))
            .transpose()?
            .map(|owner| owner == holder)
            .unwrap_or(false))
    }

    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        holder: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM core_schedule_locks WHERE schedule_id = ? AND locked_by = ?")
            .bind(schedule_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_schedule_locked(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM core_schedule_locks WHERE schedule_id = ? AND expires_at >= ?",
        )
        .bind(schedule_id.to_string())
        .bind(now.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn try_acquire_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO core_concurrency_locks (lock_key, execution_id, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE SET
                execution_id = excluded.execution_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE core_concurrency_locks.expires_at < ?
            "#,
        )
        .bind(lock_key)
        .bind(execution_id)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT execution_id FROM core_concurrency_locks WHERE lock_key = ?")
            .bind(lock_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<String, _>("execution_id"))
            .transpose()?
            .map(|owner| owner == execution_id)
            .unwrap_or(false))
    }

    async fn release_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM core_concurrency_locks WHERE lock_key = ? AND execution_id = ?")
            .bind(lock_key)
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let a = sqlx::query("DELETE FROM core_schedule_locks WHERE expires_at < ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        let b = sqlx::query("DELETE FROM core_concurrency_locks WHERE expires_at < ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(a.rows_affected() + b.rows_affected())
    }

    async fn force_release_all(&self) -> Result<u64, RepositoryError> {
        let a = sqlx::query("DELETE FROM core_schedule_locks")
            .execute(&self.pool)
            .await?;
        let b = sqlx::query("DELETE FROM core_concurrency_locks")
            .execute(&self.pool)
            .await?;
        Ok(a.rows_affected() + b.rows_affected())
    }
}

fn row_to_dlq(row: &sqlx::sqlite::SqliteRow) -> Result<DeadLetter, RepositoryError> {
    let id_raw: String = row.try_get("id")?;
    let execution_id_raw: String = row.try_get("execution_id")?;
    let params_raw: String = row.try_get("params")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let last_retry_raw: Option<String> = row.try_get("last_retry_at")?;
    let resolved_at_raw: Option<String> = row.try_get("resolved_at")?;

    Ok(DeadLetter {
        id: Uuid::parse_str(&id_raw).map_err(|e| RepositoryError::Database(e.to_string()))?,
        execution_id: Uuid::parse_str(&execution_id_raw)
            .map_err(|e| RepositoryError::Database(e.to_string()))?,
        workflow_name: row.try_get("workflow")?,
        params: serde_json::from_str(&params_raw)?,
        error: row.try_get("error")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: parse_ts(&created_at_raw)?,
        last_retry_at: last_retry_raw.map(|s| parse_ts(&s)).transpose()?,
        resolved_at: resolved_at_raw.map(|s| parse_ts(&s)).transpose()?,
        resolved_by: row.try_get("resolved_by")?,
    })
}

#[async_trait]
impl DlqRepository for SqliteRepositories {
    async fn add(&self, entry: &DeadLetter) -> Result<(), RepositoryError> {
        let params = serde_json::to_string(&entry.params)?;
        sqlx::query(
            r#"
            INSERT INTO core_dead_letters
                (id, execution_id, workflow, params, error, retry_count, max_retries, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.execution_id.to_string())
        .bind(&entry.workflow_name)
        .bind(params)
        .bind(&entry.error)
        .bind(entry.retry_count as i64)
        .bind(entry.max_retries as i64)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DeadLetter, RepositoryError> {
        let row = sqlx::query("SELECT * FROM core_dead_letters WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        row_to_dlq(&row)
    }

    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM core_dead_letters WHERE resolved_at IS NULL ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_dlq).collect()
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE core_dead_letters SET retry_count = retry_count + 1, last_retry_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE core_dead_letters SET resolved_at = ?, resolved_by = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(resolved_by)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ManifestRepository for SqliteRepositories {
    async fn has_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM core_manifest WHERE domain = ? AND partition_key = ? AND stage = ?",
        )
        .bind(domain)
        .bind(partition_key)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn record_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<(), RepositoryError> {
        let sql = DIALECT.insert_or_ignore(
            "core_manifest",
            &["domain", "partition_key", "stage", "recorded_at"],
        );
        sqlx::query(&sql)
            .bind(domain)
            .bind(partition_key)
            .bind(stage)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_reject(row: &sqlx::sqlite::SqliteRow) -> Result<Reject, RepositoryError> {
    let raw_json: String = row.try_get("raw_json")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let execution_id_raw: Option<String> = row.try_get("execution_id")?;

    Ok(Reject {
        domain: row.try_get("domain")?,
        partition_key: row.try_get("partition_key")?,
        stage: row.try_get("stage")?,
        reason_code: row.try_get("reason_code")?,
        reason_detail: row.try_get("reason_detail")?,
        raw_data: serde_json::from_str(&raw_json)?,
        record_key: row.try_get("record_key")?,
        source_locator: row.try_get("source_locator")?,
        line_number: row.try_get::<Option<i64>, _>("line_number")?.map(|n| n as u64),
        execution_id: execution_id_raw
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| RepositoryError::Database(e.to_string()))?,
        batch_id: row.try_get("batch_id")?,
        created_at: parse_ts(&created_at_raw)?,
    })
}

#[async_trait]
impl RejectRepository for SqliteRepositories {
    async fn add(&self, reject: &Reject) -> Result<(), RepositoryError> {
        let raw_json = serde_json::to_string(&reject.raw_data)?;
        sqlx::query(
            r#"
            INSERT INTO core_rejects
                (domain, partition_key, stage, reason_code, reason_detail, raw_json,
                 record_key, source_locator, line_number, execution_id, batch_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reject.domain)
        .bind(&reject.partition_key)
        .bind(&reject.stage)
        .bind(&reject.reason_code)
        .bind(&reject.reason_detail)
        .bind(raw_json)
        .bind(&reject.record_key)
        .bind(&reject.source_locator)
        .bind(reject.line_number.map(|n| n as i64))
        .bind(reject.execution_id.map(|id| id.to_string()))
        .bind(&reject.batch_id)
        .bind(reject.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_partition(&self, domain: &str, partition_key: &str) -> Result<Vec<Reject>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM core_rejects WHERE domain = ? AND partition_key = ? ORDER BY created_at ASC",
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_reject).collect()
    }

    async fn count_for_batch(&self, batch_id: &str) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM core_rejects WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}
