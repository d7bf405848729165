use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

/// Interval between heartbeat pings (in seconds).
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Ping ticker for one connection. The first tick fires one full period
/// after creation.
pub fn heartbeat_interval() -> Interval {
    let period = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
