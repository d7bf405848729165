//! Progress events published on a job's topic.
//!
//! Every event carries a per-job `sequence` stamped by the bus. Exactly one
//! terminal event ([`EventKind::is_terminal`]) ends a job's stream.

use serde::{Deserialize, Serialize};

use crate::bundle::ResultBundle;
use crate::job_events::{
    MSG_TYPE_FILE_COMPLETED, MSG_TYPE_FILE_FAILED, MSG_TYPE_FILE_STARTED, MSG_TYPE_JOB_CANCELLED,
    MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED, MSG_TYPE_UPDATE,
};
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "processing_update")]
    Update,
    #[serde(rename = "file_started")]
    FileStarted,
    #[serde(rename = "file_completed")]
    FileCompleted,
    #[serde(rename = "file_failed")]
    FileFailed,
    #[serde(rename = "processing_complete")]
    JobCompleted,
    #[serde(rename = "processing_error")]
    JobFailed,
    #[serde(rename = "processing_cancelled")]
    JobCancelled,
}

impl EventKind {
    /// `JobCompleted`, `JobFailed` and `JobCancelled` end a job's stream.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::JobCompleted | EventKind::JobFailed | EventKind::JobCancelled
        )
    }

    /// Wire name used as the serialized `type` tag.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Update => MSG_TYPE_UPDATE,
            EventKind::FileStarted => MSG_TYPE_FILE_STARTED,
            EventKind::FileCompleted => MSG_TYPE_FILE_COMPLETED,
            EventKind::FileFailed => MSG_TYPE_FILE_FAILED,
            EventKind::JobCompleted => MSG_TYPE_JOB_COMPLETED,
            EventKind::JobFailed => MSG_TYPE_JOB_FAILED,
            EventKind::JobCancelled => MSG_TYPE_JOB_CANCELLED,
        }
    }
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Byte size of one saved stem, reported with `FileCompleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSize {
    pub name: String,
    pub size_bytes: u64,
}

/// Event body. All fields are optional; absent fields are omitted on the wire.
///
/// Built with [`EventPayload::status`] and the `with_*` methods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Overall job progress, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_progress: Option<f32>,

    /// Progress within the current file, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_progress: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<ArtifactSize>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<ResultBundle>,
}

impl EventPayload {
    /// Start a payload with a human-readable status line.
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            status: Some(text.into()),
            ..Default::default()
        }
    }

    /// Set overall progress, clamped to 0-100.
    pub fn with_overall(mut self, percent: f32) -> Self {
        self.overall_progress = Some(percent.clamp(0.0, 100.0));
        self
    }

    /// Set current-file progress, clamped to 0-100.
    pub fn with_file_progress(mut self, percent: f32) -> Self {
        self.file_progress = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn with_current_file(mut self, name: impl Into<String>) -> Self {
        self.current_file = Some(name.into());
        self
    }

    pub fn with_device(mut self, label: impl Into<String>) -> Self {
        self.device = Some(label.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactSize>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_bundle(mut self, bundle: ResultBundle) -> Self {
        self.bundle = Some(bundle);
        self
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// A sequenced event on a job's progress topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Strictly increasing per job, starting at 1.
    pub sequence: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Percentage of `done` out of `total`, 0 when `total` is zero.
pub fn percent(done: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        (done as f32 / total as f32) * 100.0
    }
}
