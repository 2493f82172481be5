//! # Error Types and Handling
//!
//! This module defines the custom error types for ratelimitd and their
//! automatic conversion to HTTP responses.
//!
//! ## Error to HTTP Status Mapping
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error → HTTP Status Mapping                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error Variant               │  HTTP Status        │  Response Type    │
//! │  ────────────────────────────┼─────────────────────┼───────────────────│
//! │  Unavailable                 │  503 Service Unav.  │  JSON error       │
//! │  InvalidInput                │  400 Bad Request    │  JSON error       │
//! │  ConfigViolation             │  400 Bad Request    │  JSON error       │
//! │  Conflict                    │  409 Conflict       │  + component id   │
//! │  TransientInternal           │  503 Service Unav.  │  JSON error       │
//! │  Internal                    │  500 Internal Error │  Generic error    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Denied rate-limit decisions are NOT errors: the check path returns an
//! explicit decision value and the handler maps it to 429 with the standard
//! headers. The error channel is reserved for the kinds above.
//!
//! `Unavailable` deserves a note: whether it reaches the client at all
//! depends on the fail-open flag. With fail-open active (the default) the
//! service allows the request, counts the failure, and logs it; the 503
//! mapping below applies only when the operator chose fail-closed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Custom error type for all ratelimitd operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Backend (Redis) unreachable or timed out.
    /// Subject to the fail-open/fail-closed policy; 503 when surfaced.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Malformed request: bad key, unknown algorithm, cron parse failure.
    /// Maps to: 400 Bad Request. No state is mutated.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Composite sub-limit inconsistency, e.g. an unknown scope under
    /// hierarchical logic. The composite is denied and the offending
    /// component identified. Maps to: 409 Conflict.
    #[error("composite conflict in component '{component}': {message}")]
    Conflict { component: String, message: String },

    /// Script digest cache miss or pool exhaustion within the deadline.
    /// Retried exactly once at the backend layer; surfaces only if the
    /// retry fails, at which point it is reported like `Unavailable`.
    #[error("transient backend error: {0}")]
    TransientInternal(String),

    /// An admin update violates configuration invariants
    /// (capacity < 1, absurd window, ...). Rejected before any state change.
    #[error("configuration violation: {0}")]
    ConfigViolation(String),

    /// Unexpected internal error.
    /// Maps to: 500 Internal Server Error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Error::Unavailable(_) | Error::TransientInternal(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "backend_unavailable",
                    "message": self.to_string()
                }),
            ),
            Error::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": "invalid_input",
                    "message": self.to_string()
                }),
            ),
            Error::ConfigViolation(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": "configuration_violation",
                    "message": self.to_string()
                }),
            ),
            Error::Conflict { component, .. } => (
                StatusCode::CONFLICT,
                serde_json::json!({
                    "error": "composite_conflict",
                    "message": self.to_string(),
                    "component": component
                }),
            ),
            Error::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": "internal_error",
                    "message": "An unexpected error occurred"
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_refusal() || err.is_connection_dropped() {
            Error::Unavailable(err.to_string())
        } else {
            Error::Internal(format!("redis: {}", err))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_context() {
        let err = Error::Unavailable("connection pool timed out".to_string());
        assert!(err.to_string().contains("unavailable"));

        let err = Error::Conflict {
            component: "tenant-limit".to_string(),
            message: "unknown scope".to_string(),
        };
        assert!(err.to_string().contains("tenant-limit"));
    }

    #[test]
    fn test_config_violation_is_bad_request() {
        let resp = Error::ConfigViolation("capacity must be >= 1".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unavailable_is_service_unavailable() {
        let resp = Error::Unavailable("redis down".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
