//! [`OperationResult`] and [`Page`]: the envelope every ops-layer call
//! returns (spec.md §4.14), in place of raw `Result<T, E>` — external
//! surfaces need `warnings` and `elapsed_ms` alongside success/failure, and
//! a stable shape is easier to serialize across the REST/MCP boundary than
//! a Rust enum.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use super::error_code::OpsErrorCode;

#[derive(Debug, Clone, Serialize)]
pub struct OperationError {
    pub code: OpsErrorCode,
    pub message: String,
}

/// The uniform envelope returned by every [`super::Ops`] method.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<OperationError>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
    pub metadata: Map<String, Value>,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T, elapsed: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            warnings: Vec::new(),
            elapsed_ms: elapsed.as_millis() as u64,
            metadata: Map::new(),
        }
    }

    pub fn err((code, message): (OpsErrorCode, String), elapsed: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OperationError { code, message }),
            warnings: Vec::new(),
            elapsed_ms: elapsed.as_millis() as u64,
            metadata: Map::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A paginated list result. `total` is `None` when the caller chose not to
/// pay for a `COUNT(*)`; `has_more` is always cheap to compute (see
/// [`super::Ops::list_runs`]'s over-fetch-by-one trick) and should be
/// preferred by callers that only need "is there a next page".
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: Option<u64>,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}
