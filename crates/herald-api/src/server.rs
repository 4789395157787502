//! HTTP server setup and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. API key check (notification and template routes)
//! 5. Handler execution
//!
//! # Graceful Shutdown
//!
//! On CTRL+C or SIGTERM the server stops accepting connections, cancels the
//! shared token so background work can wind down, and waits for in-flight
//! requests.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use herald_core::Clock;
use herald_dispatch::Dispatcher;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{handlers, middleware::auth::auth_middleware};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch engine behind the API routes.
    pub dispatcher: Arc<Dispatcher>,
    /// Clock used for response timestamps.
    pub clock: Arc<dyn Clock>,
    /// Accepted bearer tokens. Empty disables authentication.
    pub api_keys: Arc<[String]>,
}

impl AppState {
    /// Creates state with authentication disabled.
    pub fn new(dispatcher: Arc<Dispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self { dispatcher, clock, api_keys: Arc::from(Vec::new()) }
    }

    /// Requires one of `keys` as a bearer token on notification and template
    /// routes.
    #[must_use]
    pub fn with_api_keys(mut self, keys: Vec<String>) -> Self {
        self.api_keys = Arc::from(keys);
        self
    }
}

/// Creates the router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use herald_api::{create_router, AppState};
/// use herald_core::RealClock;
/// use herald_dispatch::Dispatcher;
///
/// fn build(dispatcher: Arc<Dispatcher>) -> axum::Router {
///     let state = AppState::new(dispatcher, Arc::new(RealClock::new()));
///     create_router(state, Duration::from_secs(30))
/// }
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check));

    let api_routes = Router::new()
        .route("/notifications", post(handlers::create_notification))
        .route("/notifications/{id}", get(handlers::get_notification))
        .route("/notifications/{id}/audit", get(handlers::get_audit_trail))
        .route("/templates", post(handlers::create_template))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(health_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves requests on `addr` until a shutdown signal arrives or `shutdown`
/// is cancelled elsewhere.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(shutdown)).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Resolves on CTRL+C, SIGTERM or token cancellation, cancelling the token
/// in the first two cases.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
        () = terminate => info!("received SIGTERM, starting graceful shutdown"),
        () = shutdown.cancelled() => info!("shutdown requested"),
    }

    shutdown.cancel();
    warn!("waiting for in-flight requests to complete");
}
