#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use stemsplit_api::config::ServerConfig;
use stemsplit_api::router::build_app_router;
use stemsplit_api::state::AppState;
use stemsplit_core::job::JobStatus;
use stemsplit_core::types::JobId;
use stemsplit_pipeline::{Collaborators, JobService, PipelineConfig};
use tempfile::TempDir;
use tower::ServiceExt;

/// Multipart boundary used by [`MultipartBody`].
const BOUNDARY: &str = "stemsplit-test-boundary";

/// How long tests wait for a job to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default),
/// a 30-second request timeout and an 8 MB upload limit.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        max_upload_bytes: 8 * 1024 * 1024,
    }
}

/// Pipeline configuration rooted in a scratch directory.
pub fn pipeline_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        upload_dir: dir.join("uploads"),
        output_dir: dir.join("outputs"),
        ..Default::default()
    }
}

/// Router plus the service and scratch directory behind it.
pub struct TestApp {
    pub router: Router,
    pub jobs: Arc<JobService>,
    pub dir: TempDir,
}

impl TestApp {
    pub fn app(&self) -> Router {
        self.router.clone()
    }
}

/// Build the full application router with all middleware layers over a
/// job service using the built-in WAV codec and mid/side engine.
pub fn build_test_app() -> TestApp {
    build_test_app_with(test_config())
}

pub fn build_test_app_with(config: ServerConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let jobs = Arc::new(JobService::new(
        pipeline_config(dir.path()),
        Collaborators::default(),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        jobs: Arc::clone(&jobs),
    };
    let router = build_app_router(state, &config).unwrap();

    TestApp { router, jobs, dir }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_multipart(app: Router, uri: &str, body: MultipartBody) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body.finish()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Hand-built `multipart/form-data` body.
#[derive(Default)]
pub struct MultipartBody {
    bytes: Vec<u8>,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, file_name: &str, contents: &[u8]) -> Self {
        self.bytes.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        self.bytes.extend_from_slice(contents);
        self.bytes.extend_from_slice(b"\r\n");
        self
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.bytes.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
        self
    }

    fn finish(mut self) -> Vec<u8> {
        self.bytes
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.bytes
    }
}

// ---------------------------------------------------------------------------
// Audio and job helpers
// ---------------------------------------------------------------------------

/// A short 16-bit stereo WAV with distinct left and right content.
pub fn wav_bytes(frames: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 44_100,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            let left = ((i % 64) as i16 - 32) * 200;
            writer.write_sample(left).unwrap();
            writer.write_sample(left / 2).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Submit the given files and return the new job id.
pub async fn submit(app: Router, body: MultipartBody) -> JobId {
    let response = post_multipart(app, "/api/v1/jobs", body).await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    let json = body_json(response).await;
    json["data"]["job_id"].as_str().unwrap().parse().unwrap()
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_terminal(jobs: &JobService, job_id: JobId) -> JobStatus {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        loop {
            let status = jobs.status(job_id).unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not settle in time")
}
