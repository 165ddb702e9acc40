//! The Lock Manager (spec.md §4.12): atomic acquire/release/TTL for schedule
//! and concurrency locks, handed to the [`crate::scheduler::SchedulerService`]
//! and the resilience layer's `ConcurrencyGuard`.
//!
//! Grounded in the original source's
//! `examples/11_scheduling/03_distributed_locks.py` (`LockManager.acquire_schedule_lock`
//! / `release_schedule_lock` / `is_locked` / `cleanup_expired_locks` /
//! `force_release_all`), translated onto the atomic-INSERT-or-conditional-UPDATE
//! idiom the dialect's `upsert` already expresses for the ledger.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::repositories::{LockRepository, RepositoryError};

/// Default time-to-live for a lock row absent an explicit override.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

pub struct LockManager {
    repo: Arc<dyn LockRepository>,
    instance_id: String,
}

impl LockManager {
    pub fn new(repo: Arc<dyn LockRepository>, instance_id: impl Into<String>) -> Self {
        Self {
            repo,
            instance_id: instance_id.into(),
        }
    }

    /// Attempt to acquire the schedule's dispatch lock for `ttl`. Returns
    /// `true` iff this instance now holds it — a live lock held by another
    /// instance fails acquisition rather than blocking.
    pub async fn acquire_schedule_lock(
        &self,
        schedule_id: Uuid,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));
        self.repo
            .try_acquire_schedule_lock(schedule_id, &self.instance_id, now, expires_at)
            .await
    }

    /// Release the schedule's dispatch lock. Returns `true` iff this
    /// instance actually held it and a row was deleted; releasing a lock
    /// already released (or held by someone else) is a no-op returning
    /// `false`.
    pub async fn release_schedule_lock(&self, schedule_id: Uuid) -> Result<bool, RepositoryError> {
        self.repo
            .release_schedule_lock(schedule_id, &self.instance_id)
            .await
    }

    pub async fn is_locked(&self, schedule_id: Uuid) -> Result<bool, RepositoryError> {
        self.repo.is_schedule_locked(schedule_id, Utc::now()).await
    }

    /// Acquire a concurrency lock over an arbitrary caller-chosen key, e.g.
    /// `"dlq-retry:{workflow_name}"` to prevent two workers from retrying the
    /// same dead letter at once.
    pub async fn acquire_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));
        self.repo
            .try_acquire_concurrency_lock(lock_key, execution_id, now, expires_at)
            .await
    }

    pub async fn release_concurrency_lock(
        &self,
        lock_key: &str,
        execution_id: &str,
    ) -> Result<(), RepositoryError> {
        self.repo.release_concurrency_lock(lock_key, execution_id).await
    }

    /// Sweep expired lock rows. Run periodically by the scheduler's ticker,
    /// not required for correctness (expired locks are stolen on next
    /// acquire attempt regardless) but keeps the tables from growing
    /// unbounded.
    pub async fn cleanup_expired_locks(&self) -> Result<u64, RepositoryError> {
        self.repo.cleanup_expired_locks(Utc::now()).await
    }

    /// Administrative escape hatch: drop every lock row regardless of
    /// holder. Used when an instance crashes without releasing and an
    /// operator needs to unstick dispatch immediately.
    pub async fn force_release_all(&self) -> Result<u64, RepositoryError> {
        self.repo.force_release_all().await
    }
}
