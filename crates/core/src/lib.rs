//! Pure domain types shared by every stemsplit crate.
//!
//! Nothing in here performs I/O; the pipeline and API crates build on
//! these definitions.

pub mod bundle;
pub mod error;
pub mod job;
pub mod job_events;
pub mod progress;
pub mod types;
