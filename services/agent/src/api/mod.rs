//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod types;
mod v1;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::supervisor::Supervisor;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

/// Create the agent router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
