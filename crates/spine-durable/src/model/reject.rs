//! [`Reject`]: an append-only sink for malformed records encountered during
//! processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reject {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub raw_data: Value,
    pub record_key: Option<String>,
    pub source_locator: Option<String>,
    pub line_number: Option<u64>,
    pub execution_id: Option<Uuid>,
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Reject {
    pub fn new(
        domain: impl Into<String>,
        partition_key: impl Into<String>,
        stage: impl Into<String>,
        reason_code: impl Into<String>,
        raw_data: Value,
    ) -> Self {
        Self {
            domain: domain.into(),
            partition_key: partition_key.into(),
            stage: stage.into(),
            reason_code: reason_code.into(),
            reason_detail: None,
            raw_data,
            record_key: None,
            source_locator: None,
            line_number: None,
            execution_id: None,
            batch_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_reason_detail(mut self, detail: impl Into<String>) -> Self {
        self.reason_detail = Some(detail.into());
        self
    }

    pub fn with_record_key(mut self, record_key: impl Into<String>) -> Self {
        self.record_key = Some(record_key.into());
        self
    }

    pub fn with_source_locator(mut self, locator: impl Into<String>, line_number: u64) -> Self {
        self.source_locator = Some(locator.into());
        self.line_number = Some(line_number);
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}
