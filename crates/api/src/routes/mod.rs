pub mod devices;
pub mod downloads;
pub mod health;
pub mod jobs;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /jobs                        submit (multipart)
/// /jobs/{id}                   status summary
/// /jobs/{id}/start             start a queued job (POST)
/// /jobs/{id}/cancel            request cancellation (POST)
/// /jobs/{id}/events            progress stream (WebSocket)
/// /jobs/{id}/stems/{input}     stems of one input
/// /jobs/{id}/audio/{file}      single stem or original
///
/// /devices                     device pool status
///
/// /downloads/{archive}         packaged result archive
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/devices", devices::router())
        .nest("/downloads", downloads::router())
}
