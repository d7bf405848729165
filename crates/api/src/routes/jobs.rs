//! Route definitions for the `/jobs` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::{downloads, jobs};
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/jobs`.
///
/// ```text
/// POST   /                    -> submit_job
/// GET    /{id}                -> get_job
/// POST   /{id}/start          -> start_job
/// POST   /{id}/cancel         -> cancel_job
/// GET    /{id}/events         -> job_events (WebSocket upgrade)
/// GET    /{id}/stems/{input}  -> list_stems
/// GET    /{id}/audio/{file}   -> job_audio
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(jobs::submit_job))
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/start", post(jobs::start_job))
        .route("/{id}/cancel", post(jobs::cancel_job))
        .route("/{id}/events", get(ws::job_events))
        .route("/{id}/stems/{input}", get(downloads::list_stems))
        .route("/{id}/audio/{file}", get(downloads::job_audio))
}
