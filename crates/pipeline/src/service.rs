//! `JobService`: the facade the API layer talks to.
//!
//! Owns the long-lived services (registry, bus, device pool, model cache,
//! packager), constructed once and shared with every orchestrator task.

use std::sync::Arc;
use std::time::Duration;

use stemsplit_core::bundle::Artifact;
use stemsplit_core::error::CoreError;
use stemsplit_core::job::{InputFile, JobSettings, JobStatus};
use stemsplit_core::types::JobId;
use stemsplit_events::{ProgressBus, Subscription};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::config::PipelineConfig;
use crate::device::{DeviceArbiter, DevicePurge, DeviceStatus};
use crate::engine::{BuiltinEngineLoader, EngineLoader};
use crate::error::{JobError, ServiceError};
use crate::media::{AudioDecoder, StemEncoder, WavDecoder, WavEncoder};
use crate::model_cache::ModelCache;
use crate::orchestrator::Orchestrator;
use crate::packager::{is_safe_file_name, ResultPackager};
use crate::registry::{CancelOutcome, Job, JobRegistry, JobSummary};

/// External collaborators plugged into the service.
pub struct Collaborators {
    pub decoder: Arc<dyn AudioDecoder>,
    pub encoder: Arc<dyn StemEncoder>,
    pub loader: Arc<dyn EngineLoader>,
    /// Run after every device lease is released.
    pub purge: Option<Arc<dyn DevicePurge>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            decoder: Arc::new(WavDecoder),
            encoder: Arc::new(WavEncoder),
            loader: Arc::new(BuiltinEngineLoader),
            purge: None,
        }
    }
}

pub struct JobService {
    config: PipelineConfig,
    registry: Arc<JobRegistry>,
    bus: Arc<ProgressBus>,
    devices: Arc<DeviceArbiter>,
    models: Arc<ModelCache>,
    packager: Arc<ResultPackager>,
    orchestrator: Orchestrator,
    tracker: TaskTracker,
    running_limit: Option<Arc<Semaphore>>,
}

impl JobService {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let mut arbiter = DeviceArbiter::from_labels(&config.devices, config.slots_per_device);
        if let Some(purge) = collaborators.purge {
            arbiter = arbiter.with_purge(purge);
        }
        let devices = Arc::new(arbiter);
        let registry = Arc::new(JobRegistry::new(config.retired_job_capacity));
        let bus = Arc::new(ProgressBus::new(config.event_buffer));
        let models = Arc::new(ModelCache::new(collaborators.loader));
        let packager = Arc::new(ResultPackager::new(config.output_dir.clone()));

        let orchestrator = Orchestrator::new(
            Arc::clone(&models),
            Arc::clone(&devices),
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&packager),
            collaborators.decoder,
            collaborators.encoder,
        )
        .with_acquire_timeout(config.acquire_timeout);

        let running_limit = config
            .max_running_jobs
            .map(|n| Arc::new(Semaphore::new(n)));

        tracing::info!(
            output_dir = %config.output_dir.display(),
            max_running_jobs = ?config.max_running_jobs,
            "Job service ready",
        );

        Self {
            config,
            registry,
            bus,
            devices,
            models,
            packager,
            orchestrator,
            tracker: TaskTracker::new(),
            running_limit,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn models(&self) -> &Arc<ModelCache> {
        &self.models
    }

    /// Settings with this service's default engine.
    pub fn default_settings(&self) -> JobSettings {
        JobSettings {
            engine: self.config.default_engine.clone(),
            ..Default::default()
        }
    }

    /// Register a new job and open its progress topic.
    pub fn submit(
        &self,
        inputs: Vec<InputFile>,
        settings: JobSettings,
    ) -> Result<JobId, ServiceError> {
        if let Some(ttl) = self.config.unstarted_job_ttl {
            for job in self.registry.take_expired(ttl) {
                tracing::warn!(job_id = %job.id, "Job never started, expiring");
                discard_inputs(&job);
                self.orchestrator.reject(job, JobError::NotStarted(ttl.as_secs()));
            }
        }
        let job_id = self.registry.create(inputs, settings)?;
        self.bus.open(job_id);
        Ok(job_id)
    }

    /// Dispatch the job's orchestrator on its own task and return.
    pub fn start(&self, job_id: JobId) -> Result<(), ServiceError> {
        let job = self.registry.take_for_start(job_id)?;
        let orchestrator = self.orchestrator.clone();
        let limit = self.running_limit.clone();

        self.tracker.spawn(async move {
            let _permit = match limit {
                Some(semaphore) => {
                    let cancelled = job.control().cancellation_token();
                    tokio::select! {
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => {
                                orchestrator.reject(
                                    job,
                                    JobError::Internal("job supervisor shut down".to_string()),
                                );
                                return;
                            }
                        },
                        // A queued job cancelled while waiting settles right away.
                        () = cancelled.cancelled() => None,
                    }
                }
                None => None,
            };
            let status = orchestrator.run(job).await;
            tracing::debug!(job_id = %job_id, status = %status, "Job task finished");
        });

        tracing::info!(job_id = %job_id, "Job dispatched");
        Ok(())
    }

    /// Request cancellation. Succeeds for live and retired jobs.
    ///
    /// A job that was never started settles as cancelled immediately.
    pub fn cancel(&self, job_id: JobId) -> Result<(), ServiceError> {
        if let CancelOutcome::Unstarted(job) = self.registry.cancel(job_id)? {
            discard_inputs(&job);
            self.orchestrator.cancel_unstarted(job);
        }
        Ok(())
    }

    /// Stream the job's events from now until its terminal event.
    pub fn subscribe(&self, job_id: JobId) -> Result<Subscription, ServiceError> {
        Ok(self.bus.subscribe(job_id)?)
    }

    pub fn status(&self, job_id: JobId) -> Result<JobStatus, ServiceError> {
        Ok(self.registry.status(job_id)?)
    }

    pub fn summary(&self, job_id: JobId) -> Result<JobSummary, ServiceError> {
        Ok(self.registry.summary(job_id)?)
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.devices.status()
    }

    /// Read a packaged archive's bytes by name.
    pub async fn read_archive(&self, archive_name: &str) -> Result<Vec<u8>, ServiceError> {
        let packager = Arc::clone(&self.packager);
        let name = archive_name.to_string();
        let bytes = tokio::task::spawn_blocking(move || packager.read(&name))
            .await
            .map_err(|e| CoreError::Internal(format!("archive read task failed: {e}")))??;
        Ok(bytes)
    }

    /// Stems produced for one input of a finished job, in engine order.
    ///
    /// `input` is the input's base name, as used for its directory.
    pub fn list_stems(&self, job_id: JobId, input: &str) -> Result<Vec<Artifact>, ServiceError> {
        if !is_safe_file_name(input) {
            return Err(ServiceError::InvalidFileName(input.to_string()));
        }
        let summary = self.registry.summary(job_id)?;
        summary
            .bundle
            .as_ref()
            .and_then(|bundle| bundle.files.iter().find(|f| f.input == input))
            .map(|file| file.artifacts().to_vec())
            .ok_or_else(|| ServiceError::FileNotFound(input.to_string()))
    }

    /// Read one stem or uploaded original of a job by file name.
    ///
    /// Stems resolve only to files under the job's output directory.
    /// Originals resolve only to the job's recorded inputs.
    pub async fn read_job_file(&self, job_id: JobId, file_name: &str) -> Result<Vec<u8>, ServiceError> {
        if !is_safe_file_name(file_name) {
            return Err(ServiceError::InvalidFileName(file_name.to_string()));
        }
        let summary = self.registry.summary(job_id)?;
        let job_dir = self.packager.job_dir(job_id);
        let stem = summary.bundle.as_ref().and_then(|bundle| {
            bundle
                .files
                .iter()
                .flat_map(|f| f.artifacts())
                .find(|a| a.file_name == file_name && a.path.starts_with(&job_dir))
                .map(|a| a.path.clone())
        });
        let path = match stem {
            Some(path) => path,
            None => self
                .registry
                .input(job_id, file_name)?
                .map(|input| input.path)
                .ok_or_else(|| ServiceError::FileNotFound(file_name.to_string()))?,
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::FileNotFound(file_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Number of job tasks still running.
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every live job and wait up to `timeout` for their tasks.
    ///
    /// Returns `true` if all tasks finished in time. The device pool is
    /// closed afterwards.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let unstarted = self.registry.cancel_all();
        tracing::info!(
            unstarted = unstarted.len(),
            running = self.tracker.len(),
            "Shutting down job service",
        );
        for job in unstarted {
            discard_inputs(&job);
            self.orchestrator.cancel_unstarted(job);
        }

        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        if !drained {
            tracing::warn!(running = self.tracker.len(), "Job tasks still running at shutdown");
        }
        if let Some(limit) = &self.running_limit {
            limit.close();
        }
        self.devices.close();
        drained
    }
}

/// Remove the uploaded inputs of a job that will never run, then its
/// upload directory if nothing else is left in it.
fn discard_inputs(job: &Job) {
    for input in &job.inputs {
        if let Err(e) = std::fs::remove_file(&input.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(job_id = %job.id, path = %input.path.display(), error = %e, "Failed to remove input");
            }
        }
    }
    if let Some(parent) = job.inputs.first().and_then(|input| input.path.parent()) {
        let _ = std::fs::remove_dir(parent);
    }
}
