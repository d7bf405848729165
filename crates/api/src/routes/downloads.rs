use axum::routing::get;
use axum::Router;

use crate::handlers::downloads;
use crate::state::AppState;

/// Routes mounted at `/downloads`.
///
/// ```text
/// GET    /{archive}       -> download_archive
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/{archive}", get(downloads::download_archive))
}
