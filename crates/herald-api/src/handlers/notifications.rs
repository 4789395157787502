//! Notification intake and status handlers.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::{AuditEvent, NotificationId};
use herald_dispatch::{engine::CreateNotificationRequest, DispatchError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error_response;
use crate::server::AppState;

/// Audit trail of one notification.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuditTrailResponse {
    /// Notification the events belong to
    pub notification_id: NotificationId,
    /// Events, oldest first
    pub events: Vec<AuditEvent>,
}

/// Accepts a notification for asynchronous delivery.
///
/// Returns 202 with `{id, status, created_at}` once the notification is
/// queued, 400 when the body is malformed or fails validation.
#[instrument(name = "create_notification", skip_all)]
pub async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected malformed notification request");
            return error_response(&DispatchError::validation(rejection.body_text()));
        },
    };

    debug!(channel = %request.channel, "accepting notification");

    match state.dispatcher.create_notification(request).await {
        Ok(created) => {
            info!(notification_id = %created.id, "notification accepted");
            (StatusCode::ACCEPTED, Json(created)).into_response()
        },
        Err(e) => {
            warn!(error = %e, code = e.code(), "notification rejected");
            error_response(&e)
        },
    }
}

/// Returns the current status view of a notification.
#[instrument(name = "get_notification", skip_all)]
pub async fn get_notification(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Response {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.dispatcher.get_notification_status(id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Returns the audit trail of a notification.
#[instrument(name = "get_audit_trail", skip_all)]
pub async fn get_audit_trail(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Response {
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.dispatcher.audit_trail(id).await {
        Ok(events) => {
            (StatusCode::OK, Json(AuditTrailResponse { notification_id: id, events }))
                .into_response()
        },
        Err(e) => error_response(&e),
    }
}

#[allow(clippy::result_large_err)]
fn parse_id(id: Result<Path<Uuid>, PathRejection>) -> Result<NotificationId, Response> {
    id.map(|Path(uuid)| NotificationId::from(uuid)).map_err(|rejection| {
        error_response(&DispatchError::validation(format!(
            "invalid notification id: {}",
            rejection.body_text()
        )))
    })
}
