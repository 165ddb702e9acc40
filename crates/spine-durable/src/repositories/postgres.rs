//! PostgreSQL implementations of the narrow repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use spine_dialect::{Dialect, PostgresDialect};

use super::{
    DlqRepository, LockRepository, ManifestRepository, RejectRepository, RepositoryError, ScheduleRepository,
};
use crate::model::{DeadLetter, Reject, Schedule, ScheduleTargetType, ScheduleTiming};

const DIALECT: PostgresDialect = PostgresDialect;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: PgPool,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
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

fn row_to_schedule(row: &sqlx::postgres::PgRow) -> Result<Schedule, RepositoryError> {
    let target_type_raw: String = row.try_get("target_type")?;
    let schedule_type: String = row.try_get("schedule_type")?;

    Ok(Schedule {
        schedule_id: row.try_get("schedule_id")?,
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
        enabled: row.try_get("enabled")?,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        params: row.try_get("params")?,
    })
}

#[async_trait]
impl ScheduleRepository for PostgresRepositories {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        let (schedule_type, cron_expression, interval_seconds) = timing_to_columns(&schedule.timing);
        sqlx::query(
            r#"
            INSERT INTO core_schedules
                (schedule_id, name, target_type, target_name, schedule_type, cron_expression,
                 interval_seconds, enabled, next_run_at, last_run_at, params, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(schedule.schedule_id)
        .bind(&schedule.name)
        .bind(match schedule.target_type {
            ScheduleTargetType::Workflow => "workflow",
            ScheduleTargetType::Operation => "operation",
        })
        .bind(&schedule.target_name)
        .bind(schedule_type)
        .bind(cron_expression)
        .bind(interval_seconds)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(&schedule.params)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Schedule, RepositoryError> {
        let row = sqlx::query("SELECT * FROM core_schedules WHERE schedule_id = $1")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        row_to_schedule(&row)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM core_schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM core_schedules WHERE enabled = TRUE AND (next_run_at IS NULL OR next_run_at <= $1)",
        )
        .bind(now)
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
        sqlx::query("UPDATE core_schedules SET enabled = $1 WHERE schedule_id = $2")
            .bind(enabled)
            .bind(schedule_id)
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
        sqlx::query(
            "UPDATE core_schedules SET last_run_at = $1, next_run_at = $2 WHERE schedule_id = $3",
        )
        .bind(ran_at)
        .bind(next_run_at)
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockRepository for PostgresRepositories {
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (schedule_id) DO UPDATE SET
                locked_by = EXCLUDED.locked_by,
                locked_at = EXCLUDED.locked_at,
                expires_at = EXCLUDED.expires_at
            WHERE core_schedule_locks.expires_at < $5
            "#,
        )
        .bind(schedule_id)
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT locked_by FROM core_schedule_locks WHERE schedule_id = $1")
            .bind(schedule_id)
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
        let result = sqlx::query("DELETE FROM core_schedule_locks WHERE schedule_id = $1 AND locked_by = $2")
            .bind(schedule_id)
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
            "SELECT 1 AS present FROM core_schedule_locks WHERE schedule_id = $1 AND expires_at >= $2",
        )
        .bind(schedule_id)
        .bind(now)
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_key) DO UPDATE SET
                execution_id = EXCLUDED.execution_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE core_concurrency_locks.expires_at < $5
            "#,
        )
        .bind(lock_key)
        .bind(execution_id)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT execution_id FROM core_concurrency_locks WHERE lock_key = $1")
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
        sqlx::query("DELETE FROM core_concurrency_locks WHERE lock_key = $1 AND execution_id = $2")
            .bind(lock_key)
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let a = sqlx::query("DELETE FROM core_schedule_locks WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let b = sqlx::query("DELETE FROM core_concurrency_locks WHERE expires_at < $1")
            .bind(now)
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

fn row_to_dlq(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, RepositoryError> {
    Ok(DeadLetter {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        workflow_name: row.try_get("workflow")?,
        params: row.try_get("params")?,
        error: row.try_get("error")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        max_retries: row.try_get::<i32, _>("max_retries")? as u32,
        created_at: row.try_get("created_at")?,
        last_retry_at: row.try_get("last_retry_at")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
    })
}

#[async_trait]
impl DlqRepository for PostgresRepositories {
    async fn add(&self, entry: &DeadLetter) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO core_dead_letters
                (id, execution_id, workflow, params, error, retry_count, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.execution_id)
        .bind(&entry.workflow_name)
        .bind(&entry.params)
        .bind(&entry.error)
        .bind(entry.retry_count as i32)
        .bind(entry.max_retries as i32)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DeadLetter, RepositoryError> {
        let row = sqlx::query("SELECT * FROM core_dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        row_to_dlq(&row)
    }

    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM core_dead_letters WHERE resolved_at IS NULL ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_dlq).collect()
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE core_dead_letters SET retry_count = retry_count + 1, last_retry_at = $1 WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE core_dead_letters SET resolved_at = $1, resolved_by = $2 WHERE id = $3")
            .bind(Utc::now())
            .bind(resolved_by)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ManifestRepository for PostgresRepositories {
    async fn has_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM core_manifest WHERE domain = $1 AND partition_key = $2 AND stage = $3",
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
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_reject(row: &sqlx::postgres::PgRow) -> Result<Reject, RepositoryError> {
    Ok(Reject {
        domain: row.try_get("domain")?,
        partition_key: row.try_get("partition_key")?,
        stage: row.try_get("stage")?,
        reason_code: row.try_get("reason_code")?,
        reason_detail: row.try_get("reason_detail")?,
        raw_data: row.try_get("raw_json")?,
        record_key: row.try_get("record_key")?,
        source_locator: row.try_get("source_locator")?,
        line_number: row.try_get::<Option<i64>, _>("line_number")?.map(|n| n as u64),
        execution_id: row.try_get("execution_id")?,
        batch_id: row.try_get("batch_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl RejectRepository for PostgresRepositories {
    async fn add(&self, reject: &Reject) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO core_rejects
                (domain, partition_key, stage, reason_code, reason_detail, raw_json,
                 record_key, source_locator, line_number, execution_id, batch_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&reject.domain)
        .bind(&reject.partition_key)
        .bind(&reject.stage)
        .bind(&reject.reason_code)
        .bind(&reject.reason_detail)
        .bind(&reject.raw_data)
        .bind(&reject.record_key)
        .bind(&reject.source_locator)
        .bind(reject.line_number.map(|n| n as i64))
        .bind(reject.execution_id)
        .bind(&reject.batch_id)
        .bind(reject.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_partition(&self, domain: &str, partition_key: &str) -> Result<Vec<Reject>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM core_rejects WHERE domain = $1 AND partition_key = $2 ORDER BY created_at ASC",
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_reject).collect()
    }

    async fn count_for_batch(&self, batch_id: &str) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM core_rejects WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_or_ignore_generates_on_conflict_do_nothing() {
        let sql = DIALECT.insert_or_ignore("core_manifest", &["domain", "partition_key", "stage", "recorded_at"]);
        assert!(sql.contains("ON CONFLICT DO NOTHING"));
    }
}
