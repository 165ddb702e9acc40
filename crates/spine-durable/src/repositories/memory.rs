//! In-memory repositories for unit tests, mirroring [`crate::ledger::InMemoryLedger`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use super::{
    DlqRepository, LockRepository, ManifestRepository, RejectRepository, RepositoryError, ScheduleRepository,
};
use crate::model::{DeadLetter, Reject, Schedule};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct LockRow {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryRepositories {
    schedules: DashMap<Uuid, Schedule>,
    schedule_locks: DashMap<Uuid, LockRow>,
    concurrency_locks: DashMap<String, LockRow>,
    dead_letters: DashMap<Uuid, DeadLetter>,
    manifest_stages: DashSet<(String, String, String)>,
    rejects: Mutex<Vec<Reject>>,
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryRepositories {
    async fn create(&self, schedule: &Schedule) -> Result<(), RepositoryError> {
        self.schedules.insert(schedule.schedule_id, schedule.clone());
        Ok(())
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Schedule, RepositoryError> {
        self.schedules
            .get(&schedule_id)
            .map(|s| s.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Schedule>, RepositoryError> {
        Ok(self
            .schedules
            .iter()
            .find(|e| e.value().name == name)
            .map(|e| e.value().clone()))
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, RepositoryError> {
        Ok(self
            .schedules
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| s.is_due(now))
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Schedule>, RepositoryError> {
        let mut all: Vec<Schedule> = self.schedules.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|s| s.schedule_id);
        Ok(all)
    }

    async fn set_enabled(&self, schedule_id: Uuid, enabled: bool) -> Result<(), RepositoryError> {
        let mut entry = self
            .schedules
            .get_mut(&schedule_id)
            .ok_or(RepositoryError::NotFound)?;
        entry.enabled = enabled;
        Ok(())
    }

    async fn record_dispatch(
        &self,
        schedule_id: Uuid,
        ran_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut entry = self
            .schedules
            .get_mut(&schedule_id)
            .ok_or(RepositoryError::NotFound)?;
        entry.last_run_at = Some(ran_at);
        entry.next_run_at = Some(next_run_at);
        Ok(())
    }
}

#[async_trait]
impl LockRepository for InMemoryRepositories {
    async fn try_acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut acquired = false;
        self.schedule_locks
            .entry(schedule_id)
            .and_modify(|row| {
                if row.expires_at < now {
                    row.holder = holder.to_string();
                    row.expires_at = expires_at;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockRow {
                    holder: holder.to_string(),
                    expires_at,
                }
            });
        Ok(acquired)
    }

    async fn release_schedule_lock(
        &self,
        schedule_id: Uuid,
        holder: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .schedule_locks
            .remove_if(&schedule_id, |_, row| row.holder == holder)
            .is_some())
    }

    async fn is_schedule_locked(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .schedule_locks
            .get(&schedule_id)
            .map(|row| row.expires_at >= now)
            .unwrap_or(false))
    }

    async fn try_acquire_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut acquired = false;
        self.concurrency_locks
            .entry(lock_key.to_string())
            .and_modify(|row| {
                if row.expires_at < now {
                    row.holder = execution_id.to_string();
                    row.expires_at = expires_at;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockRow {
                    holder: execution_id.to_string(),
                    expires_at,
                }
            });
        Ok(acquired)
    }

    async fn release_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
    ) -> Result<(), RepositoryError> {
        self.concurrency_locks
            .remove_if(&lock_key.to_string(), |_, row| row.holder == execution_id);
        Ok(())
    }

    async fn cleanup_expired_locks(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let before = self.schedule_locks.len() + self.concurrency_locks.len();
        self.schedule_locks.retain(|_, row| row.expires_at >= now);
        self.concurrency_locks.retain(|_, row| row.expires_at >= now);
        let after = self.schedule_locks.len() + self.concurrency_locks.len();
        Ok((before - after) as u64)
    }

    async fn force_release_all(&self) -> Result<u64, RepositoryError> {
        let count = (self.schedule_locks.len() + self.concurrency_locks.len()) as u64;
        self.schedule_locks.clear();
        self.concurrency_locks.clear();
        Ok(count)
    }
}

#[async_trait]
impl DlqRepository for InMemoryRepositories {
    async fn add(&self, entry: &DeadLetter) -> Result<(), RepositoryError> {
        self.dead_letters.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DeadLetter, RepositoryError> {
        self.dead_letters
            .get(&id)
            .map(|e| e.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        let mut entries: Vec<DeadLetter> = self
            .dead_letters
            .iter()
            .map(|e| e.value().clone())
            .filter(DeadLetter::is_unresolved)
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut entry = self.dead_letters.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        entry.mark_retry_attempted();
        Ok(())
    }

    async fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<(), RepositoryError> {
        let mut entry = self.dead_letters.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        entry.resolve(resolved_by);
        Ok(())
    }
}

#[async_trait]
impl ManifestRepository for InMemoryRepositories {
    async fn has_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .manifest_stages
            .contains(&(domain.to_string(), partition_key.to_string(), stage.to_string())))
    }

    async fn record_stage(
        &self,
        domain: &str,
        partition_key: &str,
        stage: &str,
    ) -> Result<(), RepositoryError> {
        self.manifest_stages
            .insert((domain.to_string(), partition_key.to_string(), stage.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RejectRepository for InMemoryRepositories {
    async fn add(&self, reject: &Reject) -> Result<(), RepositoryError> {
        self.rejects.lock().push(reject.clone());
        Ok(())
    }

    async fn list_for_partition(&self, domain: &str, partition_key: &str) -> Result<Vec<Reject>, RepositoryError> {
        Ok(self
            .rejects
            .lock()
            .iter()
            .filter(|r| r.domain == domain && r.partition_key == partition_key)
            .cloned()
            .collect())
    }

    async fn count_for_batch(&self, batch_id: &str) -> Result<u64, RepositoryError> {
        Ok(self
            .rejects
            .lock()
            .iter()
            .filter(|r| r.batch_id.as_deref() == Some(batch_id))
            .count() as u64)
    }
}
