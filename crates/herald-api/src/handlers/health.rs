//! Health check handlers for service monitoring.
//!
//! `/health` checks the database only and is cheap enough to poll often.
//! `/ready` additionally asks every channel adapter for its health and
//! reports each circuit breaker, so orchestrators can hold traffic while
//! no channel can deliver.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::Clock;
use herald_dispatch::{
    circuit::{CircuitSnapshot, CircuitState},
    Dispatcher,
};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::server::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Per-component results
    pub checks: HealthChecks,
    /// Service version
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Everything operational
    Healthy,
    /// Serving, but some channel is unhealthy or some circuit is not closed
    Degraded,
    /// Cannot serve
    Unhealthy,
}

/// Component check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity
    pub database: ComponentHealth,
    /// Adapter health keyed by channel name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub channels: BTreeMap<String, ComponentStatus>,
    /// Breaker state keyed by channel name
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub circuits: BTreeMap<String, CircuitSnapshot>,
}

/// Result of one component check.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub response_time_ms: u64,
}

/// Component-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Working
    Up,
    /// Not working
    Down,
}

impl From<bool> for ComponentStatus {
    fn from(up: bool) -> Self {
        if up {
            Self::Up
        } else {
            Self::Down
        }
    }
}

/// Runs health checks against a dispatcher with an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a health service.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Database-only check.
    pub async fn health_check(&self, dispatcher: &Dispatcher) -> HealthResponse {
        let database = self.check_database(dispatcher).await;
        let status = match database.status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        self.response(status, HealthChecks {
            database,
            channels: BTreeMap::new(),
            circuits: BTreeMap::new(),
        })
    }

    /// Database, channel and circuit check.
    ///
    /// Unhealthy when the database is down or no channel is up. Degraded
    /// when some channel is down or some circuit is not closed.
    pub async fn readiness_check(&self, dispatcher: &Dispatcher) -> HealthResponse {
        let database = self.check_database(dispatcher).await;
        let channels: BTreeMap<String, ComponentStatus> = dispatcher
            .health_check()
            .await
            .into_iter()
            .map(|(name, up)| (name, ComponentStatus::from(up)))
            .collect();
        let circuits = dispatcher.circuit_states().await;

        let any_channel_up = channels.values().any(|s| *s == ComponentStatus::Up);
        let all_channels_up = channels.values().all(|s| *s == ComponentStatus::Up);
        let all_circuits_closed = circuits.values().all(|c| c.state == CircuitState::Closed);

        let status = if database.status == ComponentStatus::Down || !any_channel_up {
            HealthStatus::Unhealthy
        } else if all_channels_up && all_circuits_closed {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        self.response(status, HealthChecks { database, channels, circuits })
    }

    async fn check_database(&self, dispatcher: &Dispatcher) -> ComponentHealth {
        let start = self.clock.now();
        let result = dispatcher.store().health_check().await;
        let elapsed = self.clock.now().saturating_duration_since(start);
        let response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                debug!("database health check passed");
                ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms }
            },
            Err(e) => {
                error!(error = %e, "database health check failed");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("database connection failed: {e}")),
                    response_time_ms,
                }
            },
        }
    }

    fn response(&self, status: HealthStatus, checks: HealthChecks) -> HealthResponse {
        HealthResponse {
            status,
            timestamp: self.clock.now_utc(),
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn into_response(response: HealthResponse) -> Response {
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response)).into_response()
}

/// Health endpoint.
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = HealthService::new(state.clock.clone()).health_check(&state.dispatcher).await;
    debug!(status = ?response.status, "health check completed");
    into_response(response)
}

/// Readiness endpoint.
#[instrument(name = "readiness_check", skip_all)]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let response =
        HealthService::new(state.clock.clone()).readiness_check(&state.dispatcher).await;
    debug!(
        status = ?response.status,
        channels = response.checks.channels.len(),
        "readiness check completed"
    );
    into_response(response)
}

/// Liveness endpoint. Touches no dependencies.
#[instrument(name = "liveness_check", skip_all)]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "herald",
    });

    (StatusCode::OK, Json(response)).into_response()
}
