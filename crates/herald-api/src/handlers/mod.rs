//! HTTP request handlers.
//!
//! - `notifications` - create notifications and read their state
//! - `templates` - register message templates
//! - `health` - liveness, readiness and health probes
//!
//! Failures use one JSON shape, `{"error": {"code", "message"}}`, where
//! `code` comes from the dispatch error taxonomy (E1001-E3003).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_dispatch::DispatchError;
use serde::{Deserialize, Serialize};

pub mod health;
pub mod notifications;
pub mod templates;

pub use health::{health_check, liveness_check, readiness_check};
pub use notifications::{create_notification, get_audit_trail, get_notification};
pub use templates::create_template;

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error code and message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Code from the error taxonomy
    pub code: String,
    /// Human-readable description
    pub message: String,
}

/// HTTP status for a dispatch error.
pub fn status_for(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::Validation { .. } => StatusCode::BAD_REQUEST,
        DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::Provider { .. } | DispatchError::Network { .. } => StatusCode::BAD_GATEWAY,
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Configuration { .. }
        | DispatchError::Persistence { .. }
        | DispatchError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the JSON error response for `error`.
pub fn error_response(error: &DispatchError) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };
    (status_for(error), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(status_for(&DispatchError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&DispatchError::not_found("x")), StatusCode::NOT_FOUND);
    }

    #[test]
    fn server_side_failures_map_to_5xx() {
        assert!(status_for(&DispatchError::persistence("db down")).is_server_error());
        assert!(status_for(&DispatchError::circuit_open("email")).is_server_error());
        assert!(status_for(&DispatchError::timeout(100)).is_server_error());
    }
}
