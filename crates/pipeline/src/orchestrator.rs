//! Drives one job from `Queued` to exactly one terminal state.
//!
//! Per input file:
//!
//! ```text
//! FileStarted -> decode -> acquire lease -> separate -> release lease
//!             -> apply gain -> encode stems -> FileCompleted | FileFailed
//! ```
//!
//! Cancellation is observed only between files. Per-file failures are
//! recorded and skipped; structural failures (engine load, device
//! acquisition, packaging) end the job as `Failed`. The terminal event is
//! always the last thing published for a job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use stemsplit_core::bundle::{format_elapsed, Artifact, FileResult, ResultBundle};
use stemsplit_core::job::{InputFile, JobStatus};
use stemsplit_core::progress::{percent, ArtifactSize, EventKind, EventPayload};
use stemsplit_core::types::JobId;
use stemsplit_events::ProgressBus;

use crate::device::DeviceArbiter;
use crate::engine::SeparationEngine;
use crate::error::{panic_message, FileError, JobError};
use crate::media::{AudioDecoder, StemEncoder};
use crate::model_cache::ModelCache;
use crate::packager::ResultPackager;
use crate::registry::{Job, JobControl, JobRegistry};

/// Per-file progress checkpoints.
const FILE_PROGRESS_SEPARATING: f32 = 30.0;
const FILE_PROGRESS_SAVING: f32 = 80.0;

/// Text published when a job task dies without settling.
const ABORTED_MESSAGE: &str = "job task aborted before completion";

// ---------------------------------------------------------------------------
// TerminalGuard
// ---------------------------------------------------------------------------

/// Publishes `JobFailed` and retires the job if the orchestrator task is
/// dropped (aborted or panicking) before settling it.
struct TerminalGuard {
    job_id: JobId,
    control: Arc<JobControl>,
    registry: Arc<JobRegistry>,
    bus: Arc<ProgressBus>,
    settled: bool,
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::error!(job_id = %self.job_id, "Job task ended without a terminal state");

        if !self.control.status().is_terminal() {
            let _ = self.control.transition(JobStatus::Failed);
        }
        self.registry.retire(self.job_id, None);
        if self.bus.is_open(self.job_id) {
            self.bus.publish(
                self.job_id,
                EventKind::JobFailed,
                EventPayload::status("Processing failed").with_error(ABORTED_MESSAGE),
            );
        }
    }
}

/// Outcome of one file step that is not a success.
enum StepError {
    File(FileError),
    Job(JobError),
}

impl From<FileError> for StepError {
    fn from(err: FileError) -> Self {
        StepError::File(err)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs jobs against the shared long-lived services. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    models: Arc<ModelCache>,
    devices: Arc<DeviceArbiter>,
    registry: Arc<JobRegistry>,
    bus: Arc<ProgressBus>,
    packager: Arc<ResultPackager>,
    decoder: Arc<dyn AudioDecoder>,
    encoder: Arc<dyn StemEncoder>,
    acquire_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        models: Arc<ModelCache>,
        devices: Arc<DeviceArbiter>,
        registry: Arc<JobRegistry>,
        bus: Arc<ProgressBus>,
        packager: Arc<ResultPackager>,
        decoder: Arc<dyn AudioDecoder>,
        encoder: Arc<dyn StemEncoder>,
    ) -> Self {
        Self {
            models,
            devices,
            registry,
            bus,
            packager,
            decoder,
            encoder,
            acquire_timeout: None,
        }
    }

    /// Bound every device acquisition; `None` waits indefinitely.
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn guard(&self, job: &Job) -> TerminalGuard {
        TerminalGuard {
            job_id: job.id,
            control: Arc::clone(job.control()),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            settled: false,
        }
    }

    /// Fail a job that never got to run (e.g. the supervisor shut down).
    pub fn reject(&self, job: Job, error: JobError) -> JobStatus {
        let mut guard = self.guard(&job);
        self.fail(&mut guard, error, Vec::new(), Duration::ZERO)
    }

    /// Settle a job whose cancellation arrived before it ran.
    pub fn cancel_unstarted(&self, job: Job) -> JobStatus {
        let mut guard = self.guard(&job);
        tracing::info!(job_id = %job.id, "Job cancelled before start");
        self.settle(
            &mut guard,
            JobStatus::Cancelled,
            EventKind::JobCancelled,
            EventPayload::status("Processing cancelled"),
            None,
        )
    }

    /// Process `job` to completion and return its terminal status.
    pub async fn run(&self, job: Job) -> JobStatus {
        if job.control().is_cancel_requested() {
            return self.cancel_unstarted(job);
        }

        let started = Instant::now();
        let mut guard = self.guard(&job);
        let control = Arc::clone(job.control());
        let job_id = job.id;

        if let Err(e) = control.transition(JobStatus::Running) {
            return self.fail(&mut guard, JobError::Internal(e.to_string()), Vec::new(), started.elapsed());
        }

        let total = job.inputs.len();
        tracing::info!(
            job_id = %job_id,
            files = total,
            engine = %job.settings.engine,
            "Job started",
        );

        self.publish(
            job_id,
            EventKind::Update,
            EventPayload::status(format!("Loading engine '{}'", job.settings.engine))
                .with_overall(0.0),
        );
        let engine = match self.models.resolve(&job.settings.engine).await {
            Ok(engine) => engine,
            Err(e) => return self.fail(&mut guard, e.into(), Vec::new(), started.elapsed()),
        };

        let labels: Vec<&str> = self.devices.devices().iter().map(|d| d.label.as_str()).collect();
        // The leased device is reported per file, once a lease is granted.
        self.publish(
            job_id,
            EventKind::Update,
            EventPayload::status(format!(
                "Using engine '{}' on device pool [{}]",
                engine.name(),
                labels.join(", ")
            ))
            .with_overall(0.0),
        );

        let mut files: Vec<FileResult> = Vec::with_capacity(total);
        let mut failures: u32 = 0;
        let mut cancelled = false;

        for (index, input) in job.inputs.iter().enumerate() {
            if control.is_cancel_requested() {
                cancelled = true;
                if let Err(e) = control.transition(JobStatus::Cancelling) {
                    tracing::error!(job_id = %job_id, error = %e, "Cannot enter cancelling state");
                }
                tracing::info!(job_id = %job_id, processed = index, "Stopping at file boundary");
                break;
            }

            self.publish(
                job_id,
                EventKind::FileStarted,
                EventPayload::status(format!("Processing {}/{}: {}", index + 1, total, input.name))
                    .with_overall(percent(index, total))
                    .with_file_progress(0.0)
                    .with_current_file(&input.name),
            );

            match self.process_file(&job, &engine, input, index).await {
                Ok(artifacts) => {
                    control.record_success();
                    let sizes = artifacts
                        .iter()
                        .map(|a| ArtifactSize {
                            name: a.file_name.clone(),
                            size_bytes: a.size_bytes,
                        })
                        .collect();
                    tracing::info!(
                        job_id = %job_id,
                        file = %input.name,
                        stems = artifacts.len(),
                        "File processed",
                    );
                    self.publish(
                        job_id,
                        EventKind::FileCompleted,
                        EventPayload::status(format!("Completed {}/{}: {}", index + 1, total, input.name))
                            .with_overall(percent(index + 1, total))
                            .with_file_progress(100.0)
                            .with_current_file(&input.name)
                            .with_artifacts(sizes),
                    );
                    files.push(FileResult::succeeded(input.base_name(), artifacts));
                }
                Err(StepError::File(e)) => {
                    failures += 1;
                    tracing::warn!(job_id = %job_id, file = %input.name, error = %e, "File failed");
                    self.publish(
                        job_id,
                        EventKind::FileFailed,
                        EventPayload::status(format!("Failed {}/{}: {}", index + 1, total, input.name))
                            .with_overall(percent(index + 1, total))
                            .with_current_file(&input.name)
                            .with_error(e.to_string()),
                    );
                    files.push(FileResult::failed(input.base_name(), e.to_string()));

                    if let Some(limit) = job.settings.max_file_failures {
                        if failures >= limit {
                            return self.fail(
                                &mut guard,
                                JobError::TooManyFailures(failures),
                                files,
                                started.elapsed(),
                            );
                        }
                    }
                }
                Err(StepError::Job(e)) => {
                    files.push(FileResult::failed(input.base_name(), e.to_string()));
                    return self.fail(&mut guard, e, files, started.elapsed());
                }
            }
        }

        let succeeded = control.succeeded();

        if cancelled {
            let archive = if succeeded > 0 && !control.cancelled_before_any_success() {
                self.package(job_id, &files)
                    .await
                    .inspect_err(|e| {
                        tracing::warn!(job_id = %job_id, error = %e, "Partial archive failed");
                    })
                    .ok()
            } else {
                None
            };
            let bundle = ResultBundle {
                job_id,
                files,
                archive,
                total_time: format_elapsed(started.elapsed()),
            };
            let mut payload = EventPayload::status(format!(
                "Processing cancelled after {succeeded} of {total} files"
            ));
            if bundle.archive.is_some() {
                payload = payload.with_bundle(bundle.clone());
            }
            return self.settle(
                &mut guard,
                JobStatus::Cancelled,
                EventKind::JobCancelled,
                payload,
                Some(bundle),
            );
        }

        if succeeded == 0 {
            return self.fail(&mut guard, JobError::NothingProcessed, files, started.elapsed());
        }

        let archive = match self.package(job_id, &files).await {
            Ok(name) => name,
            Err(e) => return self.fail(&mut guard, e, files, started.elapsed()),
        };
        let bundle = ResultBundle {
            job_id,
            files,
            archive: Some(archive),
            total_time: format_elapsed(started.elapsed()),
        };
        tracing::info!(
            job_id = %job_id,
            succeeded,
            failed = bundle.failed_count(),
            total_time = %bundle.total_time,
            "Job completed",
        );
        let payload = EventPayload::status(format!(
            "Processing complete: {succeeded} of {total} files in {}",
            bundle.total_time
        ))
        .with_overall(100.0)
        .with_bundle(bundle.clone());

        self.settle(
            &mut guard,
            JobStatus::Completed,
            EventKind::JobCompleted,
            payload,
            Some(bundle),
        )
    }

    // ---- file step ----

    async fn process_file(
        &self,
        job: &Job,
        engine: &Arc<dyn SeparationEngine>,
        input: &InputFile,
        index: usize,
    ) -> Result<Vec<Artifact>, StepError> {
        let total = job.inputs.len();
        let progress = |file_percent: f32| overall_progress(index, total, file_percent);

        let decoder = Arc::clone(&self.decoder);
        let path = input.path.clone();
        let audio = run_blocking(move || decoder.decode(&path).map_err(FileError::Decode)).await?;

        if let Some(expected) = engine.sample_rate() {
            if expected != audio.sample_rate {
                return Err(FileError::SampleRate {
                    expected,
                    actual: audio.sample_rate,
                }
                .into());
            }
        }

        let lease = self
            .devices
            .acquire(job.settings.device_hint.as_deref(), self.acquire_timeout)
            .await
            .map_err(|e| StepError::Job(e.into()))?;
        let device_label = lease.device().label.clone();
        tracing::debug!(job_id = %job.id, file = %input.name, device = %device_label, "Separating");

        self.publish(
            job.id,
            EventKind::Update,
            EventPayload::status("Separating stems...")
                .with_overall(progress(FILE_PROGRESS_SEPARATING))
                .with_file_progress(FILE_PROGRESS_SEPARATING)
                .with_current_file(&input.name)
                .with_device(&device_label),
        );

        // The lease is dropped inside the worker, on panic too.
        let separator = Arc::clone(engine);
        let stems = run_blocking(move || {
            let result = separator.separate(&audio, lease.device());
            drop(lease);
            result.map_err(FileError::from)
        })
        .await?;

        self.publish(
            job.id,
            EventKind::Update,
            EventPayload::status("Saving stems...")
                .with_overall(progress(FILE_PROGRESS_SAVING))
                .with_file_progress(FILE_PROGRESS_SAVING)
                .with_current_file(&input.name),
        );

        let encoder = Arc::clone(&self.encoder);
        let gain = job.settings.gain_adjustment;
        let base_name = input.base_name().to_string();
        let dir: PathBuf = self
            .packager
            .output_dir()
            .join(job.id.to_string())
            .join(&base_name);

        let artifacts = run_blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let mut artifacts = Vec::with_capacity(stems.len());
            for mut stem in stems {
                stem.audio.apply_gain(gain);
                let file_name = format!("{base_name}_{}.{}", stem.name, encoder.extension());
                let path = dir.join(&file_name);
                let size_bytes = encoder
                    .encode(&stem.audio, &path)
                    .map_err(|source| FileError::Save {
                        stem: stem.name.clone(),
                        source,
                    })?;
                artifacts.push(Artifact {
                    name: stem.name,
                    file_name,
                    size_bytes,
                    path,
                });
            }
            Ok(artifacts)
        })
        .await?;

        Ok(artifacts)
    }

    // ---- settling ----

    async fn package(&self, job_id: JobId, files: &[FileResult]) -> Result<String, JobError> {
        let packager = Arc::clone(&self.packager);
        let files = files.to_vec();
        let path = tokio::task::spawn_blocking(move || packager.package(job_id, &files))
            .await
            .map_err(|e| JobError::Internal(format!("packaging task failed: {e}")))??;
        tracing::debug!(job_id = %job_id, path = %path.display(), "Archive ready");
        Ok(ResultPackager::archive_name(job_id))
    }

    fn fail(
        &self,
        guard: &mut TerminalGuard,
        error: JobError,
        files: Vec<FileResult>,
        elapsed: Duration,
    ) -> JobStatus {
        tracing::error!(job_id = %guard.job_id, error = %error, "Job failed");
        let bundle = ResultBundle {
            job_id: guard.job_id,
            files,
            archive: None,
            total_time: format_elapsed(elapsed),
        };
        self.settle(
            guard,
            JobStatus::Failed,
            EventKind::JobFailed,
            EventPayload::status("Processing failed").with_error(error.to_string()),
            Some(bundle),
        )
    }

    /// Enter the terminal state, retire the job and publish the terminal
    /// event, in that order.
    fn settle(
        &self,
        guard: &mut TerminalGuard,
        status: JobStatus,
        kind: EventKind,
        payload: EventPayload,
        bundle: Option<ResultBundle>,
    ) -> JobStatus {
        if let Err(e) = guard.control.transition(status) {
            tracing::error!(job_id = %guard.job_id, error = %e, "Invalid terminal transition");
        }
        self.registry.retire(guard.job_id, bundle);
        self.publish(guard.job_id, kind, payload);
        guard.settled = true;
        status
    }

    fn publish(&self, job_id: JobId, kind: EventKind, payload: EventPayload) {
        self.bus.publish(job_id, kind, payload);
    }
}

/// Overall job progress given the file index and progress within it.
fn overall_progress(index: usize, total: usize, file_percent: f32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (index as f32 + file_percent / 100.0) / total as f32 * 100.0
}

/// Run a blocking file step, turning a worker panic into a file error.
async fn run_blocking<T, F>(f: F) -> Result<T, FileError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(FileError::Panicked(panic_message(&*e.into_panic()))),
        Err(e) => Err(FileError::Panicked(e.to_string())),
    }
}
