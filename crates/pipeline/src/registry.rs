//! Process-wide registry of live and recently retired jobs.
//!
//! A job is live from submission until its orchestrator settles it, then
//! moves to a bounded retired set so status queries and idempotent cancels
//! keep working after completion.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use stemsplit_core::bundle::ResultBundle;
use stemsplit_core::error::CoreError;
use stemsplit_core::job::{validate_inputs, InputFile, JobSettings, JobStatus};
use stemsplit_core::types::{JobId, Timestamp};
use tokio_util::sync::CancellationToken;

/// Default number of retired jobs kept for status queries.
pub const DEFAULT_RETIRED_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// JobControl
// ---------------------------------------------------------------------------

/// Shared, mutable half of a job: status and the cancellation flag.
///
/// Only the owning orchestrator calls [`JobControl::transition`]; every
/// other party may only read the status or request cancellation.
#[derive(Debug)]
pub struct JobControl {
    id: JobId,
    status: Mutex<JobStatus>,
    cancel: CancellationToken,
    succeeded: AtomicUsize,
    succeeded_at_cancel: OnceLock<usize>,
}

impl JobControl {
    fn new(id: JobId) -> Self {
        Self {
            id,
            status: Mutex::new(JobStatus::Queued),
            cancel: CancellationToken::new(),
            succeeded: AtomicUsize::new(0),
            succeeded_at_cancel: OnceLock::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip the cancellation flag. Returns `true` only for the call that
    /// set it; later calls and calls on settled jobs are no-ops.
    pub fn request_cancel(&self) -> bool {
        if self.status().is_terminal() || self.cancel.is_cancelled() {
            return false;
        }
        self.succeeded_at_cancel
            .get_or_init(|| self.succeeded.load(Ordering::SeqCst));
        self.cancel.cancel();
        tracing::info!(job_id = %self.id, "Cancellation requested");
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when cancellation is requested.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&self, next: JobStatus) -> Result<JobStatus, CoreError> {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.can_transition_to(next) {
            return Err(CoreError::Conflict(format!(
                "Job {} cannot move from {} to {next}",
                self.id, *current
            )));
        }
        tracing::debug!(job_id = %self.id, from = %*current, to = %next, "Job status changed");
        *current = next;
        Ok(next)
    }

    /// Count one successfully processed file.
    pub fn record_success(&self) -> usize {
        self.succeeded.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Whether cancellation arrived before any file had succeeded.
    pub fn cancelled_before_any_success(&self) -> bool {
        self.succeeded_at_cancel.get() == Some(&0)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A submitted job, handed to its orchestrator on start.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// Processing order; also the progress denominator.
    pub inputs: Vec<InputFile>,
    pub settings: JobSettings,
    pub created_at: Timestamp,
    control: Arc<JobControl>,
}

impl Job {
    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }

    pub fn status(&self) -> JobStatus {
        self.control.status()
    }
}

/// Result of [`JobRegistry::cancel`].
#[derive(Debug)]
pub enum CancelOutcome {
    /// The flag was set on a started job; it stops at the next file boundary.
    Requested,
    /// The flag was already set, or the job has already finished.
    Unchanged,
    /// The job was never started. It has been handed back to the caller,
    /// who must settle it.
    Unstarted(Job),
}

/// Point-in-time view of a job, live or retired.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub inputs: Vec<String>,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<ResultBundle>,
}

// ---------------------------------------------------------------------------
// JobRegistry
// ---------------------------------------------------------------------------

struct LiveJob {
    control: Arc<JobControl>,
    inputs: Vec<InputFile>,
    created_at: Timestamp,
    /// Present until the job is started.
    pending: Option<Job>,
}

struct Retired {
    status: JobStatus,
    bundle: Option<ResultBundle>,
    inputs: Vec<InputFile>,
    created_at: Timestamp,
    cancel_requested: bool,
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<JobId, LiveJob>,
    retired: HashMap<JobId, Retired>,
    retired_order: VecDeque<JobId>,
}

pub struct JobRegistry {
    state: RwLock<RegistryState>,
    retired_capacity: usize,
}

impl JobRegistry {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            retired_capacity: retired_capacity.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and register a new `Queued` job.
    pub fn create(
        &self,
        inputs: Vec<InputFile>,
        settings: JobSettings,
    ) -> Result<JobId, CoreError> {
        validate_inputs(&inputs)?;
        settings.validate()?;

        let id = JobId::new();
        let control = Arc::new(JobControl::new(id));
        let created_at = chrono::Utc::now();
        let job = Job {
            id,
            inputs: inputs.clone(),
            settings,
            created_at,
            control: Arc::clone(&control),
        };

        self.write().live.insert(
            id,
            LiveJob {
                control,
                inputs,
                created_at,
                pending: Some(job),
            },
        );
        tracing::info!(job_id = %id, "Job created");
        Ok(id)
    }

    /// Hand the job to its orchestrator. Each job can be taken once.
    pub fn take_for_start(&self, id: JobId) -> Result<Job, CoreError> {
        let mut state = self.write();
        if state.retired.contains_key(&id) {
            return Err(CoreError::Conflict(format!("Job {id} has already finished")));
        }
        let live = state.live.get_mut(&id).ok_or(CoreError::NotFound(id))?;
        live.pending
            .take()
            .ok_or_else(|| CoreError::Conflict(format!("Job {id} has already been started")))
    }

    /// Request cancellation. Succeeds for live and retired jobs.
    ///
    /// A job that was never started is taken out of the pending slot and
    /// returned, so it cannot be started afterwards.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CoreError> {
        let mut state = self.write();
        if let Some(live) = state.live.get_mut(&id) {
            let flagged = live.control.request_cancel();
            if let Some(job) = live.pending.take() {
                return Ok(CancelOutcome::Unstarted(job));
            }
            return Ok(if flagged {
                CancelOutcome::Requested
            } else {
                CancelOutcome::Unchanged
            });
        }
        if state.retired.contains_key(&id) {
            tracing::debug!(job_id = %id, "Cancel on retired job ignored");
            return Ok(CancelOutcome::Unchanged);
        }
        Err(CoreError::NotFound(id))
    }

    /// Take every job that has waited longer than `max_age` without being
    /// started. The caller settles them.
    pub fn take_expired(&self, max_age: Duration) -> Vec<Job> {
        let now = chrono::Utc::now();
        let mut state = self.write();
        state
            .live
            .values_mut()
            .filter(|live| {
                live.pending.is_some()
                    && (now - live.created_at)
                        .to_std()
                        .is_ok_and(|age| age >= max_age)
            })
            .filter_map(|live| live.pending.take())
            .collect()
    }

    pub fn status(&self, id: JobId) -> Result<JobStatus, CoreError> {
        let state = self.read();
        if let Some(live) = state.live.get(&id) {
            return Ok(live.control.status());
        }
        state
            .retired
            .get(&id)
            .map(|r| r.status)
            .ok_or(CoreError::NotFound(id))
    }

    pub fn summary(&self, id: JobId) -> Result<JobSummary, CoreError> {
        let state = self.read();
        if let Some(live) = state.live.get(&id) {
            return Ok(JobSummary {
                job_id: id,
                status: live.control.status(),
                cancel_requested: live.control.is_cancel_requested(),
                inputs: input_names(&live.inputs),
                created_at: live.created_at,
                bundle: None,
            });
        }
        let retired = state.retired.get(&id).ok_or(CoreError::NotFound(id))?;
        Ok(JobSummary {
            job_id: id,
            status: retired.status,
            cancel_requested: retired.cancel_requested,
            inputs: input_names(&retired.inputs),
            created_at: retired.created_at,
            bundle: retired.bundle.clone(),
        })
    }

    /// The uploaded input named `name`, if the job has one.
    pub fn input(&self, id: JobId, name: &str) -> Result<Option<InputFile>, CoreError> {
        let state = self.read();
        let inputs = match state.live.get(&id) {
            Some(live) => &live.inputs,
            None => &state.retired.get(&id).ok_or(CoreError::NotFound(id))?.inputs,
        };
        Ok(inputs.iter().find(|i| i.name == name).cloned())
    }

    /// Move a settled job out of the live set. The status is read from
    /// the job's control, which must already be terminal.
    pub fn retire(&self, id: JobId, bundle: Option<ResultBundle>) {
        let mut state = self.write();
        let Some(live) = state.live.remove(&id) else {
            tracing::warn!(job_id = %id, "Retire called for unknown job");
            return;
        };
        let status = live.control.status();
        debug_assert!(status.is_terminal(), "retiring job {id} in state {status}");

        state.retired.insert(
            id,
            Retired {
                status,
                bundle,
                inputs: live.inputs,
                created_at: live.created_at,
                cancel_requested: live.control.is_cancel_requested(),
            },
        );
        state.retired_order.push_back(id);
        while state.retired_order.len() > self.retired_capacity {
            if let Some(old) = state.retired_order.pop_front() {
                state.retired.remove(&old);
            }
        }
        tracing::info!(job_id = %id, status = %status, "Job retired");
    }

    /// Request cancellation of every live job. Jobs that were never
    /// started are taken and returned for the caller to settle.
    pub fn cancel_all(&self) -> Vec<Job> {
        let mut state = self.write();
        let mut unstarted = Vec::new();
        for live in state.live.values_mut() {
            live.control.request_cancel();
            unstarted.extend(live.pending.take());
        }
        unstarted
    }

    pub fn live_count(&self) -> usize {
        self.read().live.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETIRED_CAPACITY)
    }
}

fn input_names(inputs: &[InputFile]) -> Vec<String> {
    inputs.iter().map(|i| i.name.clone()).collect()
}
