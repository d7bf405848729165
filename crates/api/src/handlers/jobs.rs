//! Handlers for the `/jobs` resource.
//!
//! Submission is a multipart upload: every part carrying a file name is an
//! input, the remaining text parts are job settings.

use std::path::Path as FsPath;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use stemsplit_core::job::{InputFile, JobSettings, JobStatus};
use stemsplit_core::types::JobId;
use stemsplit_pipeline::JobSummary;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Longest file name kept from an upload.
const MAX_FILE_NAME_LEN: usize = 200;

/// Response body for a successful submission.
#[derive(Debug, Serialize)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Stored input names, in submission order.
    pub inputs: Vec<String>,
    pub settings: JobSettings,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Store the uploaded files and register a queued job. Settings parts:
/// `engine`, `gain_adjustment`, `device_hint`, `max_file_failures`.
pub async fn submit_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let staging = state
        .jobs
        .config()
        .upload_dir
        .join(uuid::Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| AppError::InternalError(format!("Failed to create upload dir: {e}")))?;

    let submission = match receive_upload(multipart, &staging, state.jobs.default_settings()).await
    {
        Ok(submission) => submission,
        Err(e) => {
            discard_staging(&staging).await;
            return Err(e);
        }
    };

    let inputs: Vec<String> = submission.inputs.iter().map(|i| i.name.clone()).collect();
    let settings = submission.settings.clone();
    let job_id = match state.jobs.submit(submission.inputs, submission.settings) {
        Ok(id) => id,
        Err(e) => {
            discard_staging(&staging).await;
            return Err(e.into());
        }
    };

    tracing::info!(
        job_id = %job_id,
        files = inputs.len(),
        engine = %settings.engine,
        "Job submitted",
    );

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmittedJob {
                job_id,
                status: JobStatus::Queued,
                inputs,
                settings,
            },
        }),
    ))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<JobSummary>>> {
    let job_id = parse_job_id(&id)?;
    let summary = state.jobs.summary(job_id)?;
    Ok(Json(DataResponse { data: summary }))
}

/// POST /api/v1/jobs/{id}/start
///
/// Dispatch a queued job. Returns immediately; progress is on the
/// job's event stream.
pub async fn start_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    state.jobs.start(job_id)?;
    let summary = state.jobs.summary(job_id)?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: summary })))
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Request cancellation. Succeeds without effect on finished jobs.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    state.jobs.cancel(job_id)?;
    let summary = state.jobs.summary(job_id)?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: summary })))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid job id: {raw}")))
}

struct Submission {
    inputs: Vec<InputFile>,
    settings: JobSettings,
}

/// Drain the multipart body, writing file parts under `staging`.
async fn receive_upload(
    mut multipart: Multipart,
    staging: &FsPath,
    mut settings: JobSettings,
) -> AppResult<Submission> {
    let mut inputs = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();

        if let Some(upload_name) = field.file_name() {
            let name = sanitize_file_name(upload_name, inputs.len());
            let path = staging.join(&name);

            let mut out = tokio::fs::File::create(&path)
                .await
                .map_err(|e| AppError::InternalError(format!("Failed to store upload: {e}")))?;
            while let Some(chunk) = field
                .chunk()
                .await
                .map_err(|e| AppError::BadRequest(e.to_string()))?
            {
                out.write_all(&chunk)
                    .await
                    .map_err(|e| AppError::InternalError(format!("Failed to store upload: {e}")))?;
            }
            out.flush()
                .await
                .map_err(|e| AppError::InternalError(format!("Failed to store upload: {e}")))?;

            tracing::debug!(file = %name, path = %path.display(), "Stored upload");
            inputs.push(InputFile::new(name, path));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        apply_setting(&mut settings, &field_name, value.trim())?;
    }

    Ok(Submission { inputs, settings })
}

/// Apply one text part to the settings. Unknown parts are ignored.
fn apply_setting(settings: &mut JobSettings, field: &str, value: &str) -> AppResult<()> {
    match field {
        "engine" => {
            if !value.is_empty() {
                settings.engine = value.to_string();
            }
        }
        "gain_adjustment" => {
            settings.gain_adjustment = value
                .parse()
                .map_err(|_| AppError::BadRequest(format!("Invalid gain_adjustment: {value}")))?;
        }
        "device_hint" => {
            settings.device_hint = (!value.is_empty()).then(|| value.to_string());
        }
        "max_file_failures" => {
            settings.max_file_failures = if value.is_empty() {
                None
            } else {
                Some(value.parse().map_err(|_| {
                    AppError::BadRequest(format!("Invalid max_file_failures: {value}"))
                })?)
            };
        }
        other => {
            tracing::debug!(field = %other, "Ignoring unknown submission field");
        }
    }
    Ok(())
}

/// Reduce an uploaded file name to a safe single path component.
///
/// Directory parts are dropped and anything outside `[A-Za-z0-9._ -]` is
/// replaced with `_`. Falls back to `input_{index}` when nothing usable
/// remains.
pub fn sanitize_file_name(raw: &str, index: usize) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();

    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        format!("input_{index}")
    } else {
        cleaned
    }
}

async fn discard_staging(dir: &FsPath) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove upload dir");
    }
}
