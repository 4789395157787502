//! Bearer token authentication.
//!
//! When the service is configured with API keys, notification routes require
//! `Authorization: Bearer <key>` matching one of them. With no keys
//! configured every request passes.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::server::AppState;

/// Extracts the token from a `Bearer <token>` Authorization header.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Authentication failures.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    /// The token matches no configured key.
    InvalidApiKey,
    /// The Authorization header is missing or not a bearer token.
    MissingHeader,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::InvalidApiKey => "Invalid API key",
            Self::MissingHeader => "Missing Authorization header",
        };

        (StatusCode::UNAUTHORIZED, message).into_response()
    }
}

fn authorize(keys: &[String], headers: &HeaderMap) -> Result<(), AuthError> {
    if keys.is_empty() {
        return Ok(());
    }

    let api_key = extract_api_key(headers).ok_or(AuthError::MissingHeader)?;
    if keys.iter().any(|key| key == api_key) {
        Ok(())
    } else {
        Err(AuthError::InvalidApiKey)
    }
}

/// Axum middleware enforcing the configured API keys.
pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    if let Err(e) = authorize(&state.api_keys, req.headers()) {
        debug!(reason = ?e, "request rejected by API key check");
        return Err(e);
    }

    Ok(next.run(req).await)
}
