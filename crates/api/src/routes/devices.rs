use axum::routing::get;
use axum::Router;

use crate::handlers::devices;
use crate::state::AppState;

/// Routes mounted at `/devices`.
///
/// ```text
/// GET    /                -> device_status
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(devices::device_status))
}
