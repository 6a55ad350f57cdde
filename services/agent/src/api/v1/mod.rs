//! API v1 routes.

mod containers;
mod images;

use axum::Router;

use super::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/containers", containers::routes())
        .merge(images::routes())
}
