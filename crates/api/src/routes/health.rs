use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Job tasks currently running or queued for a running slot.
    pub running_jobs: usize,
    /// Separation engines already loaded into the model cache.
    pub loaded_engines: Vec<String>,
    /// Total device slots in the pool.
    pub device_capacity: usize,
    /// Device slots not currently leased.
    pub free_slots: usize,
}

/// GET /health -- returns service and device pool health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let devices = state.jobs.device_status();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        running_jobs: state.jobs.running_tasks(),
        loaded_engines: state.jobs.models().loaded_names(),
        device_capacity: devices.capacity,
        free_slots: devices.free,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
