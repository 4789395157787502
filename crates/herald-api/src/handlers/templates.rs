//! Template registration handler.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_dispatch::{engine::CreateTemplateRequest, DispatchError};
use tracing::{info, instrument, warn};

use super::error_response;
use crate::server::AppState;

/// Registers a template that notifications can reference by id.
///
/// Returns 201 with the stored template, 400 when the body is malformed,
/// empty, or reuses an existing name.
#[instrument(name = "create_template", skip_all)]
pub async fn create_template(
    State(state): State<AppState>,
    payload: Result<Json<CreateTemplateRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "rejected malformed template request");
            return error_response(&DispatchError::validation(rejection.body_text()));
        },
    };

    match state.dispatcher.create_template(request).await {
        Ok(template) => {
            info!(template_id = %template.id, "template registered");
            (StatusCode::CREATED, Json(template)).into_response()
        },
        Err(e) => {
            warn!(error = %e, code = e.code(), "template rejected");
            error_response(&e)
        },
    }
}
