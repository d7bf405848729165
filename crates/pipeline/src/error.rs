use stemsplit_core::error::CoreError;

use crate::device::AcquireError;
use crate::engine::{EngineLoadError, InferenceError};
use crate::media::MediaError;
use crate::packager::PackagingError;

/// Failure confined to one input file. Recorded in the bundle and
/// published as `FileFailed`; the job continues with the next file.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("Decode failed: {0}")]
    Decode(MediaError),

    #[error("Sample rate mismatch: engine expects {expected} Hz, input is {actual} Hz")]
    SampleRate { expected: u32, actual: u32 },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Saving stem '{stem}' failed: {source}")]
    Save { stem: String, source: MediaError },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// Failure outside any single-file scope. Ends the job as `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    EngineLoad(#[from] EngineLoadError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("Packaging failed: {0}")]
    Packaging(#[from] PackagingError),

    #[error("No input file was processed successfully")]
    NothingProcessed,

    #[error("Aborted after {0} failed files")]
    TooManyFailures(u32),

    #[error("Job was not started within {0} seconds")]
    NotStarted(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by [`crate::JobService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Invalid archive name: {0}")]
    InvalidArchiveName(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PackagingError> for ServiceError {
    fn from(err: PackagingError) -> Self {
        match err {
            PackagingError::NotFound(name) => ServiceError::ArchiveNotFound(name),
            PackagingError::InvalidName(name) => ServiceError::InvalidArchiveName(name),
            PackagingError::Io(e) => ServiceError::Io(e),
            other => ServiceError::Core(CoreError::Internal(other.to_string())),
        }
    }
}

/// Describe a panic payload caught from a blocking worker.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
