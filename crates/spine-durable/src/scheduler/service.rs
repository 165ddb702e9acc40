//! [`SchedulerService`]: resolves due schedules to `WorkSpec`s and hands them
//! to the [`Dispatcher`], exactly once across however many instances are
//! running, by holding each schedule's dispatch lock for the duration of the
//! submission (spec.md §4.11).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use super::backend::{IntervalTicker, TickerBackend, TickerHealth};
use crate::dispatcher::{DispatchError, Dispatcher, SubmitOutcome};
use crate::lock_manager::{LockManager, DEFAULT_LOCK_TTL};
use crate::model::{Schedule, ScheduleTargetType, TriggerSource, WorkSpec};
use crate::repositories::{RepositoryError, ScheduleRepository};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("ticker error: {0}")]
    Ticker(#[from] super::backend::TickerError),

    #[error("schedule {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerHealth {
    pub ticker: TickerHealth,
}

pub struct SchedulerService {
    repo: Arc<dyn ScheduleRepository>,
    locks: Arc<LockManager>,
    dispatcher: Arc<Dispatcher>,
    ticker: Arc<dyn TickerBackend>,
    interval: Duration,
    lock_ttl: Duration,
}

impl SchedulerService {
    pub fn new(
        repo: Arc<dyn ScheduleRepository>,
        locks: Arc<LockManager>,
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
    ) -> Self {
        Self {
            repo,
            locks,
            dispatcher,
            ticker: Arc::new(IntervalTicker::new()),
            interval,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    pub fn with_ticker(mut self, ticker: Arc<dyn TickerBackend>) -> Self {
        self.ticker = ticker;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Start the background tick loop. Each tick calls [`Self::tick_once`]
    /// and logs (never panics on) whatever it returns.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let this = self.clone();
        self.ticker.clone().start(
            self.interval,
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move {
                    if let Err(err) = this.tick_once().await {
                        tracing::warn!(error = %err, "scheduler tick failed");
                    }
                })
            }),
        )?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.ticker.stop().await;
    }

    pub fn health(&self) -> SchedulerHealth {
        SchedulerHealth {
            ticker: self.ticker.health(),
        }
    }

    /// Evaluate every due, enabled schedule once: lock, dispatch, advance
    /// `next_run_at`, unlock. A schedule whose lock another instance holds is
    /// silently skipped this tick — it will be reconsidered next tick or
    /// picked up once the lock expires.
    pub async fn tick_once(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let due = self.repo.list_due(now).await?;
        let mut dispatched = 0;

        for schedule in due {
            if !self.locks.acquire_schedule_lock(schedule.schedule_id, self.lock_ttl).await? {
                continue;
            }

            let result = self.dispatch_schedule(&schedule, now).await;
            if let Err(err) = &result {
                tracing::warn!(schedule = %schedule.name, error = %err, "scheduled dispatch failed");
            } else {
                dispatched += 1;
            }

            if let Ok(next_run_at) = schedule.compute_next_run_at(now) {
                let _ = self.repo.record_dispatch(schedule.schedule_id, now, next_run_at).await;
            }

            let _ = self.locks.release_schedule_lock(schedule.schedule_id).await;
        }

        Ok(dispatched)
    }

    /// Dispatch `schedule` immediately, bypassing `is_due`/lock coordination.
    /// Used for operator-triggered manual runs (spec.md §4.11's "trigger").
    pub async fn trigger(&self, schedule_id: Uuid) -> Result<SubmitOutcome, SchedulerError> {
        let schedule = self.repo.get(schedule_id).await?;
        self.dispatch_schedule(&schedule, Utc::now())
            .await
            .map_err(|_| SchedulerError::NotFound(schedule_id))
    }

    pub async fn pause(&self, schedule_id: Uuid) -> Result<(), SchedulerError> {
        self.repo.set_enabled(schedule_id, false).await?;
        Ok(())
    }

    pub async fn resume(&self, schedule_id: Uuid) -> Result<(), SchedulerError> {
        self.repo.set_enabled(schedule_id, true).await?;
        Ok(())
    }

    async fn dispatch_schedule(
        &self,
        schedule: &Schedule,
        _now: chrono::DateTime<Utc>,
    ) -> Result<SubmitOutcome, DispatchError> {
        let spec = match schedule.target_type {
            ScheduleTargetType::Workflow => WorkSpec::workflow(schedule.target_name.clone()),
            ScheduleTargetType::Operation => WorkSpec::task(schedule.target_name.clone()),
        }
        .with_params(schedule.params.clone())
        .with_trigger_source(TriggerSource::Schedule)
        .with_metadata("schedule_id", schedule.schedule_id.to_string());

        self.dispatcher.submit(spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryExecutor;
    use crate::ledger::InMemoryLedger;
    use crate::model::{ScheduleTiming, WorkKind};
    use crate::registry::HandlerRegistry;
    use crate::repositories::InMemoryRepositories;

    async fn make_service() -> (Arc<SchedulerService>, Arc<InMemoryRepositories>, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                WorkKind::Task,
                "heartbeat",
                |_: serde_json::Value| async move { Ok(serde_json::json!({"ok": true})) },
                None,
                vec![],
            )
            .unwrap();
        let executor = Arc::new(InMemoryExecutor::new(ledger.clone(), registry.clone()));
        let dispatcher = Arc::new(Dispatcher::new(ledger.clone(), registry, executor));
        let repos = Arc::new(InMemoryRepositories::new());
        let locks = Arc::new(LockManager::new(repos.clone(), "scheduler-test"));
        let service = Arc::new(SchedulerService::new(
            repos.clone(),
            locks,
            dispatcher,
            Duration::from_millis(10),
        ));
        (service, repos, ledger)
    }

    #[tokio::test]
    async fn tick_dispatches_due_schedules_and_advances_next_run() {
        let (service, repos, _ledger) = make_service().await;
        let schedule = Schedule::new(
            "heartbeat-every-minute",
            ScheduleTargetType::Operation,
            "heartbeat",
            ScheduleTiming::IntervalSeconds(60),
        )
        .unwrap();
        repos.create(&schedule).await.unwrap();

        let dispatched = service.tick_once().await.unwrap();
        assert_eq!(dispatched, 1);

        let updated = repos.get(schedule.schedule_id).await.unwrap();
        assert!(updated.next_run_at.unwrap() > Utc::now());
        assert!(updated.last_run_at.is_some());
    }

    #[tokio::test]
    async fn disabled_schedules_are_never_due() {
        let (service, repos, _ledger) = make_service().await;
        let schedule = Schedule::new(
            "paused",
            ScheduleTargetType::Operation,
            "heartbeat",
            ScheduleTiming::IntervalSeconds(60),
        )
        .unwrap();
        repos.create(&schedule).await.unwrap();
        service.pause(schedule.schedule_id).await.unwrap();

        let dispatched = service.tick_once().await.unwrap();
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn trigger_dispatches_immediately_regardless_of_next_run_at() {
        let (service, repos, _ledger) = make_service().await;
        let mut schedule = Schedule::new(
            "future",
            ScheduleTargetType::Operation,
            "heartbeat",
            ScheduleTiming::IntervalSeconds(3600),
        )
        .unwrap();
        schedule.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        repos.create(&schedule).await.unwrap();

        assert_eq!(service.tick_once().await.unwrap(), 0);
        let outcome = service.trigger(schedule.schedule_id).await.unwrap();
        assert!(!outcome.deduplicated);
    }
}
