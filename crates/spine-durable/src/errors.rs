//! Error taxonomy shared across the engine.
//!
//! Every component-specific error (`LedgerError`, `DispatchError`,
//! `WorkflowError`, ...) converts into a [`SpineError`] so a handler can
//! bubble any of them with `?` and have the dispatcher uniformly categorize
//! and route it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse-grained error category carried on every [`SpineError`] for routing
/// and alerting decisions by external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Database,
    Storage,
    Source,
    Parse,
    Validation,
    Config,
    Auth,
    Pipeline,
    Orchestration,
    Internal,
    Unknown,
}

impl ErrorCategory {
    /// Whether errors of this category are retryable by default. Individual
    /// errors may still override this via `SpineError::retryable`.
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Database | Self::Unknown)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "NETWORK",
            Self::Database => "DATABASE",
            Self::Storage => "STORAGE",
            Self::Source => "SOURCE",
            Self::Parse => "PARSE",
            Self::Validation => "VALIDATION",
            Self::Config => "CONFIG",
            Self::Auth => "AUTH",
            Self::Pipeline => "PIPELINE",
            Self::Orchestration => "ORCHESTRATION",
            Self::Internal => "INTERNAL",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Where an error happened, for log correlation. Mirrors the original
/// source's `ErrorContext` (component + operation + extra key/values).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    pub component: Option<String>,
    pub operation: Option<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            operation: Some(operation.into()),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }
}

/// The error type stored on a failed `RunRecord` and surfaced by the ops
/// layer. Data-oriented rather than a deep exception hierarchy, per §9's
/// guidance that idiomatic Rust favors structs over inheritance.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct SpineError {
    pub message: String,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    #[serde(default)]
    pub context: ErrorContext,
}

impl SpineError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let retryable = category.default_retryable();
        Self {
            message: message.into(),
            category,
            retryable,
            retry_after: None,
            context: ErrorContext::default(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// The error's type name, stored verbatim on `RunRecord.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self.category {
            ErrorCategory::Network => "NetworkError",
            ErrorCategory::Database => "DatabaseError",
            ErrorCategory::Storage => "StorageError",
            ErrorCategory::Source => "SourceError",
            ErrorCategory::Parse => "ParseError",
            ErrorCategory::Validation => "ValidationError",
            ErrorCategory::Config => "ConfigError",
            ErrorCategory::Auth => "AuthError",
            ErrorCategory::Pipeline => "PipelineError",
            ErrorCategory::Orchestration => "OrchestrationError",
            ErrorCategory::Internal => "InternalError",
            ErrorCategory::Unknown => "UnknownError",
        }
    }
}
