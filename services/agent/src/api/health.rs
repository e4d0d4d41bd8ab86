//! Health endpoint.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use fleetd_workflow::PoolStats;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while the main worker is not running.
    pub status: String,
    pub service: String,
    pub version: String,
    pub system_id: String,
    pub timestamp: String,
    pub workers: PoolStats,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let workers = state.pool().stats().await;
    let status = if workers.main_running { "ok" } else { "degraded" };

    Json(HealthResponse {
        status: status.to_string(),
        service: "fleet-agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        system_id: state.pool().system_id().to_string(),
        timestamp: Utc::now().to_rfc3339(),
        workers,
    })
}
