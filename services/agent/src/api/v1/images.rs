//! Image and checkpoint endpoints.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};

use crate::api::error::ApiError;
use crate::api::types::{PushRequest, RestoreRequest};
use crate::api::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/images/push", post(push_image))
        .route("/restore", post(restore_checkpoint))
}

/// POST /v1/images/push
async fn push_image(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().push(&req.reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/restore
///
/// Restores are idempotent only in failure: a second restore of the same
/// checkpoint conflicts with the container the first one created.
async fn restore_checkpoint(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().restore(&req.reference, req.live).await?;
    Ok(StatusCode::CREATED)
}
