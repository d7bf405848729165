use std::sync::Arc;

use stemsplit_pipeline::JobService;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Job submission, control and progress streaming.
    pub jobs: Arc<JobService>,
}
