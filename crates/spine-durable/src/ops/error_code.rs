//! [`OpsErrorCode`]: the stable error vocabulary spec.md §4.14 lists,
//! carried on every failed [`super::OperationResult`] instead of a raw error
//! enum so external surfaces (REST, MCP, CLI) have one small, stable set of
//! codes to switch on regardless of which internal component failed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpsErrorCode {
    NotFound,
    ValidationFailed,
    Conflict,
    NotCancellable,
    AlreadyComplete,
    Locked,
    QuotaExceeded,
    RateLimited,
    Transient,
    Unavailable,
    Internal,
}

impl OpsErrorCode {
    /// Whether a caller should expect a retry to help. REST surfaces map
    /// this alongside the HTTP status; it is not itself a status code.
    pub fn retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Unavailable | Self::RateLimited)
    }
}

impl std::fmt::Display for OpsErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NOT_FOUND",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Conflict => "CONFLICT",
            Self::NotCancellable => "NOT_CANCELLABLE",
            Self::AlreadyComplete => "ALREADY_COMPLETE",
            Self::Locked => "LOCKED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Transient => "TRANSIENT",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_unavailable_are_retryable() {
        assert!(OpsErrorCode::Transient.retryable());
        assert!(OpsErrorCode::Unavailable.retryable());
        assert!(!OpsErrorCode::ValidationFailed.retryable());
    }
}
