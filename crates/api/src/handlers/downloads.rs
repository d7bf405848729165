//! Handlers for packaged result downloads and per-file audio.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::AppResult;
use crate::handlers::jobs::parse_job_id;
use crate::response::DataResponse;
use crate::state::AppState;

/// One stem of an input, as listed to clients.
#[derive(Debug, Serialize)]
pub struct StemEntry {
    pub name: String,
    pub file_name: String,
    pub url: String,
    pub size_bytes: u64,
}

/// GET /api/v1/downloads/{archive}
///
/// Return a job's result archive as an attachment.
pub async fn download_archive(
    State(state): State<AppState>,
    Path(archive): Path<String>,
) -> AppResult<Response> {
    let bytes = state.jobs.read_archive(&archive).await?;
    tracing::info!(archive = %archive, size = bytes.len(), "Serving result archive");

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{archive}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

/// GET /api/v1/jobs/{id}/stems/{input}
///
/// List the stems produced for one input of a finished job.
pub async fn list_stems(
    State(state): State<AppState>,
    Path((id, input)): Path<(String, String)>,
) -> AppResult<Json<DataResponse<Vec<StemEntry>>>> {
    let job_id = parse_job_id(&id)?;
    let stems = state
        .jobs
        .list_stems(job_id, &input)?
        .into_iter()
        .map(|artifact| StemEntry {
            url: format!("/api/v1/jobs/{job_id}/audio/{}", artifact.file_name),
            name: artifact.name,
            file_name: artifact.file_name,
            size_bytes: artifact.size_bytes,
        })
        .collect();
    Ok(Json(DataResponse { data: stems }))
}

/// GET /api/v1/jobs/{id}/audio/{file}
///
/// Serve a single stem or an uploaded original for playback.
pub async fn job_audio(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> AppResult<Response> {
    let job_id = parse_job_id(&id)?;
    let bytes = state.jobs.read_job_file(job_id, &file).await?;
    tracing::debug!(job_id = %job_id, file = %file, size = bytes.len(), "Serving audio file");

    Ok((
        [
            (header::CONTENT_TYPE, audio_content_type(&file).to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{file}\""),
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

fn audio_content_type(file_name: &str) -> &'static str {
    let extension = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}
