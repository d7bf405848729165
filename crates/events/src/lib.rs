//! Per-job progress event bus.
//!
//! - [`ProgressBus`]: one `tokio::sync::broadcast` topic per job, with
//!   bus-stamped sequence numbers and close-on-terminal semantics.
//! - [`Subscription`]: an independent consumer cursor on one job's topic.

pub mod bus;

pub use bus::{ProgressBus, Subscription};
