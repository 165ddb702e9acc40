//! Dead-letter queue manager (spec.md §3, §4.7).
//!
//! `retry(dlq_id)` builds the [`WorkSpec`] for a fresh execution rather than
//! mutating the DLQ row itself — "not mutating the DLQ row" per spec.md
//! §4.7 — leaving submission to whatever holds the
//! [`crate::dispatcher::Dispatcher`], which this module does not depend on to
//! avoid a cycle (dispatcher depends on resilience, not the reverse).

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::model::{DeadLetter, TriggerSource, WorkSpec};
use crate::repositories::{DlqRepository, RepositoryError};

pub struct DlqManager {
    repo: Arc<dyn DlqRepository>,
}

impl DlqManager {
    pub fn new(repo: Arc<dyn DlqRepository>) -> Self {
        Self { repo }
    }

    pub async fn add_to_dlq(
        &self,
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        params: Value,
        error: impl Into<String>,
        max_retries: u32,
    ) -> Result<DeadLetter, RepositoryError> {
        let entry = DeadLetter::new(execution_id, workflow_name, params, error, max_retries);
        self.repo.add(&entry).await?;
        Ok(entry)
    }

    pub async fn get(&self, id: Uuid) -> Result<DeadLetter, RepositoryError> {
        self.repo.get(id).await
    }

    pub async fn list_unresolved(&self, limit: u32) -> Result<Vec<DeadLetter>, RepositoryError> {
        self.repo.list_unresolved(limit).await
    }

    /// Returns the [`WorkSpec`] for a fresh retry execution if the entry is
    /// still eligible (`can_retry`), along with the source entry. The caller
    /// submits the spec to the dispatcher and is responsible for calling
    /// [`Self::mark_retry_attempted`] once it has done so.
    pub async fn retry(&self, dlq_id: Uuid) -> Result<Option<(WorkSpec, DeadLetter)>, RepositoryError> {
        let entry = self.repo.get(dlq_id).await?;
        if !entry.can_retry() {
            return Ok(None);
        }
        let spec = WorkSpec::workflow(entry.workflow_name.clone())
            .with_params(entry.params.clone())
            .with_trigger_source(TriggerSource::Retry)
            .with_metadata("dlq_id", dlq_id.to_string());
        Ok(Some((spec, entry)))
    }

    pub async fn mark_retry_attempted(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.repo.mark_retry_attempted(id).await
    }

    pub async fn resolve(&self, id: Uuid, resolved_by: &str) -> Result<(), RepositoryError> {
        self.repo.resolve(id, resolved_by).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemoryRepositories;

    #[tokio::test]
    async fn retry_is_none_once_max_retries_exhausted() {
        let repo = Arc::new(InMemoryRepositories::new());
        let manager = DlqManager::new(repo);

        let entry = manager
            .add_to_dlq(Uuid::now_v7(), "close.daily", Value::Null, "boom", 1)
            .await
            .unwrap();

        let (spec, _) = manager.retry(entry.id).await.unwrap().unwrap();
        assert_eq!(spec.name, "close.daily");
        manager.mark_retry_attempted(entry.id).await.unwrap();

        assert!(manager.retry(entry.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolved_entries_are_not_retryable() {
        let repo = Arc::new(InMemoryRepositories::new());
        let manager = DlqManager::new(repo);

        let entry = manager
            .add_to_dlq(Uuid::now_v7(), "close.daily", Value::Null, "boom", 3)
            .await
            .unwrap();
        manager.resolve(entry.id, "operator").await.unwrap();

        assert!(manager.retry(entry.id).await.unwrap().is_none());
    }
}
