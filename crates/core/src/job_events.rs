//! Wire names for progress event kinds.
//!
//! Used as the `type` tag of serialized [`ProgressEvent`]s sent to
//! WebSocket subscribers.
//!
//! [`ProgressEvent`]: crate::progress::ProgressEvent

/// Intermediate status / percentage update.
pub const MSG_TYPE_UPDATE: &str = "processing_update";

/// Processing of one input file began.
pub const MSG_TYPE_FILE_STARTED: &str = "file_started";

/// One input file was separated and its stems saved.
pub const MSG_TYPE_FILE_COMPLETED: &str = "file_completed";

/// One input file failed and was skipped.
pub const MSG_TYPE_FILE_FAILED: &str = "file_failed";

/// Job completed and the archive is ready.
pub const MSG_TYPE_JOB_COMPLETED: &str = "processing_complete";

/// Job failed with a structural error.
pub const MSG_TYPE_JOB_FAILED: &str = "processing_error";

/// Job was cancelled on request.
pub const MSG_TYPE_JOB_CANCELLED: &str = "processing_cancelled";
