//! HTTP control surface.

pub mod error;
mod health;
mod v1;

use std::sync::Arc;

use axum::Router;
use fleetd_workflow::{Environment, WorkerPool};
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pool: Arc<WorkerPool>,
}

impl AppState {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn env(&self) -> &Environment {
        self.pool.environment()
    }
}

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
