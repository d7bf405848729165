//! WebSocket progress streaming.
//!
//! Each connection follows one job's progress topic and closes after the
//! job's terminal event.

mod handler;
mod heartbeat;

pub use handler::job_events;
pub use heartbeat::heartbeat_interval;
