//! Container endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::api::error::ApiError;
use crate::api::types::{
    CheckpointRequest, CheckpointResponse, CreateRequest, ListResponse, MigrateBody,
};
use crate::api::AppState;
use crate::container::Container;
use crate::migrate::MigrateRequest;
use crate::supervisor::ContainerInfo;

/// Create container routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_container).get(list_containers))
        .route(
            "/{id}",
            get(get_container)
                .put(update_container)
                .delete(delete_container),
        )
        .route("/{id}/start", post(start_container))
        .route("/{id}/stop", post(stop_container))
        .route("/{id}/kill", post(kill_container))
        .route("/{id}/rollback", post(rollback_container))
        .route("/{id}/checkpoint", post(checkpoint_container))
        .route("/{id}/migrate", post(migrate_container))
}

/// POST /v1/containers
async fn create_container(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().create(req.container, req.update).await?;
    Ok(StatusCode::CREATED)
}

/// GET /v1/containers
async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<ContainerInfo>>, ApiError> {
    let items = state.supervisor().list().await?;
    Ok(Json(ListResponse { items }))
}

/// GET /v1/containers/{id}
async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ApiError> {
    Ok(Json(state.supervisor().get(&id).await?))
}

/// PUT /v1/containers/{id}
async fn update_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(container): Json<Container>,
) -> Result<StatusCode, ApiError> {
    if container.id != id {
        return Err(ApiError::bad_request(
            "id_mismatch",
            format!("body id '{}' does not match path id '{}'", container.id, id),
        ));
    }
    state.supervisor().update(container).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/containers/{id}
async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/containers/{id}/start
async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().start(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/containers/{id}/stop
async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().stop(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/containers/{id}/kill
async fn kill_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().kill(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/containers/{id}/rollback
async fn rollback_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.supervisor().rollback(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/containers/{id}/checkpoint
async fn checkpoint_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CheckpointRequest>,
) -> Result<Json<CheckpointResponse>, ApiError> {
    let descriptor = state
        .supervisor()
        .checkpoint(&id, &req.reference, req.live, req.exit)
        .await?;
    Ok(Json(CheckpointResponse {
        digest: descriptor.digest,
    }))
}

/// POST /v1/containers/{id}/migrate
async fn migrate_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MigrateBody>,
) -> Result<StatusCode, ApiError> {
    let request = MigrateRequest {
        id,
        to: req.to,
        reference: req.reference,
        live: req.live,
        stop: req.stop,
        delete: req.delete,
    };
    state.supervisor().migrate(&request).await?;
    Ok(StatusCode::NO_CONTENT)
}
