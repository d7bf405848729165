//! Handlers for the `/devices` resource.

use axum::extract::State;
use axum::Json;
use stemsplit_pipeline::DeviceStatus;

use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/devices
///
/// Pool size, per-device slot usage and totals.
pub async fn device_status(State(state): State<AppState>) -> Json<DataResponse<DeviceStatus>> {
    Json(DataResponse {
        data: state.jobs.device_status(),
    })
}
