//! Job configuration, inputs and the lifecycle state machine.
//!
//! ```text
//! Queued -> Running -> Completed
//!                   -> Failed
//!                   -> Cancelling -> Cancelled
//!                   -> Cancelled
//! Queued -> Failed
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Engine used when the submission does not name one.
pub const DEFAULT_ENGINE: &str = "mid-side";

/// Lowest accepted gain adjustment (silence).
pub const MIN_GAIN: f32 = 0.0;

/// Highest accepted gain adjustment.
pub const MAX_GAIN: f32 = 8.0;

/// Maximum length of an engine name.
const MAX_ENGINE_NAME_LEN: usize = 64;

/// Maximum length of a device hint.
const MAX_DEVICE_HINT_LEN: usize = 64;

// ---------------------------------------------------------------------------
// JobSettings
// ---------------------------------------------------------------------------

/// Immutable per-job configuration resolved at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Name of the separation engine, resolved through the model cache.
    pub engine: String,
    /// Multiplier applied to every produced stem's amplitude.
    pub gain_adjustment: f32,
    /// Preferred device label (e.g. `"cuda:1"`); any free device otherwise.
    pub device_hint: Option<String>,
    /// Abort the job once this many files have failed. `None` never aborts.
    pub max_file_failures: Option<u32>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            gain_adjustment: 1.0,
            device_hint: None,
            max_file_failures: None,
        }
    }
}

impl JobSettings {
    /// Validate the settings.
    ///
    /// Rules:
    /// - Engine name must be non-empty, at most 64 characters, and contain
    ///   only alphanumeric, hyphen, underscore, or dot characters.
    /// - Gain must be finite and within `MIN_GAIN..=MAX_GAIN`.
    /// - Device hint, when present, must be non-empty and at most 64 characters.
    /// - Failure limit, when present, must be at least 1.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.engine.is_empty() {
            return Err(CoreError::Validation(
                "Engine name must not be empty".to_string(),
            ));
        }
        if self.engine.len() > MAX_ENGINE_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "Engine name must not exceed {MAX_ENGINE_NAME_LEN} characters"
            )));
        }
        if !self
            .engine
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(CoreError::Validation(
                "Engine name may only contain alphanumeric, hyphen, underscore, or dot characters"
                    .to_string(),
            ));
        }
        if !self.gain_adjustment.is_finite()
            || !(MIN_GAIN..=MAX_GAIN).contains(&self.gain_adjustment)
        {
            return Err(CoreError::Validation(format!(
                "Gain adjustment must be between {MIN_GAIN} and {MAX_GAIN}"
            )));
        }
        if let Some(hint) = &self.device_hint {
            if hint.is_empty() || hint.len() > MAX_DEVICE_HINT_LEN {
                return Err(CoreError::Validation(format!(
                    "Device hint must be between 1 and {MAX_DEVICE_HINT_LEN} characters"
                )));
            }
        }
        if self.max_file_failures == Some(0) {
            return Err(CoreError::Validation(
                "max_file_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InputFile
// ---------------------------------------------------------------------------

/// One uploaded input, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    /// Display name (the sanitized upload file name).
    pub name: String,
    /// Location on disk.
    pub path: PathBuf,
}

impl InputFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// File name without its extension; names the output directory.
    pub fn base_name(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.name,
        }
    }
}

/// Validate a submission's input list: at least one file, unique names.
pub fn validate_inputs(inputs: &[InputFile]) -> Result<(), CoreError> {
    if inputs.is_empty() {
        return Err(CoreError::Validation(
            "A job needs at least one input file".to_string(),
        ));
    }
    for (i, input) in inputs.iter().enumerate() {
        if input.name.is_empty() {
            return Err(CoreError::Validation(format!(
                "Input at index {i} has an empty name"
            )));
        }
        if inputs[..i].iter().any(|prev| prev.base_name() == input.base_name()) {
            return Err(CoreError::Validation(format!(
                "Duplicate input name: {}",
                input.base_name()
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// `Completed`, `Failed` and `Cancelled` end the job.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
