//! Routing error taxonomy.
//!
//! Every failure the routing core can surface is represented here. Callers
//! branch on the variant (or on [`RoutingError::code`]) rather than on
//! message text.
//!
//! | Variant             | Retriable | Notes                                   |
//! |---------------------|-----------|-----------------------------------------|
//! | Validation          | no        | malformed input                         |
//! | Conflict            | no        | duplicate id/default, stale version     |
//! | NotFound            | no        | unknown model or template               |
//! | ProtectedResource   | no        | default model or in-flight reference    |
//! | NoAvailableModel    | no        | every candidate filtered or open        |
//! | NoMatch             | no        | hard constraint unsatisfiable           |
//! | Provider            | advisory  | `retry_elsewhere` says if fallback helps|
//! | Timeout             | advisory  | provider error subtype                  |
//! | Storage             | no        | persistence failure, never masked       |

use thiserror::Error;

use crate::store::StoreError;

/// Result type for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protected resource: {0}")]
    ProtectedResource(String),

    #[error("no available model: {0}")]
    NoAvailableModel(String),

    #[error("no model matches the request: {0}")]
    NoMatch(String),

    #[error("provider call to '{model_id}' failed: {message}")]
    Provider {
        model_id: String,
        message: String,
        /// Whether a retry against a different model is advisable.
        retry_elsewhere: bool,
    },

    #[error("provider call to '{model_id}' timed out after {timeout_ms}ms")]
    Timeout { model_id: String, timeout_ms: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl RoutingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn protected(msg: impl Into<String>) -> Self {
        Self::ProtectedResource(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ProtectedResource(_) => "PROTECTED_RESOURCE",
            Self::NoAvailableModel(_) => "NO_AVAILABLE_MODEL",
            Self::NoMatch(_) => "NO_MATCH",
            Self::Provider { .. } => "PROVIDER_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether this error came from the upstream provider. Timeouts count.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::Provider { .. } | Self::Timeout { .. })
    }

    /// Whether the caller may reasonably retry against a different model.
    ///
    /// The core never retries on its own; this is advice for caller-level
    /// fallback policies.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Provider {
                retry_elsewhere, ..
            } => *retry_elsewhere,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_provider_failure() {
        let err = RoutingError::Timeout {
            model_id: "m".into(),
            timeout_ms: 100,
        };
        assert!(err.is_provider_failure());
        assert!(err.is_retriable());
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[test]
    fn test_structural_errors_not_retriable() {
        assert!(!RoutingError::validation("bad").is_retriable());
        assert!(!RoutingError::conflict("dup").is_retriable());
        assert!(!RoutingError::protected("default").is_provider_failure());
    }

    #[test]
    fn test_provider_retry_advice() {
        let err = RoutingError::Provider {
            model_id: "m".into(),
            message: "400 bad request".into(),
            retry_elsewhere: false,
        };
        assert!(err.is_provider_failure());
        assert!(!err.is_retriable());
    }
}
