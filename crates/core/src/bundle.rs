//! Result bundle produced once per job.
//!
//! ```text
//! ResultBundle
//!   files[0]  "song_a"  -> Succeeded { center.wav, sides.wav }
//!   files[1]  "song_b"  -> Failed { "decode error: ..." }
//!   archive   "<job_id>_stems.zip"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::JobId;

/// One produced output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Component name reported by the engine (e.g. `"center"`).
    pub name: String,
    /// File name inside the per-input directory.
    pub file_name: String,
    pub size_bytes: u64,
    /// Storage location on disk.
    pub path: PathBuf,
}

/// Outcome of processing a single input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Succeeded { artifacts: Vec<Artifact> },
    Failed { error: String },
}

/// Per-input entry of a bundle, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    /// Original input name without extension; the archive directory name.
    pub input: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

impl FileResult {
    pub fn succeeded(input: impl Into<String>, artifacts: Vec<Artifact>) -> Self {
        Self {
            input: input.into(),
            outcome: FileOutcome::Succeeded { artifacts },
        }
    }

    pub fn failed(input: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            outcome: FileOutcome::Failed {
                error: error.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FileOutcome::Succeeded { .. })
    }

    /// Artifacts of a successful file; empty for failures.
    pub fn artifacts(&self) -> &[Artifact] {
        match &self.outcome {
            FileOutcome::Succeeded { artifacts } => artifacts,
            FileOutcome::Failed { .. } => &[],
        }
    }
}

/// Aggregated per-file results plus the packaged archive, if any.
///
/// Immutable once published on a terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub job_id: JobId,
    pub files: Vec<FileResult>,
    /// Archive file name, relative to the output directory.
    pub archive: Option<String>,
    /// Wall-clock processing time, formatted `mm:ss`.
    pub total_time: String,
}

impl ResultBundle {
    pub fn succeeded_count(&self) -> usize {
        self.files.iter().filter(|f| f.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.files.len() - self.succeeded_count()
    }
}

/// Format an elapsed duration as zero-padded `mm:ss`.
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
