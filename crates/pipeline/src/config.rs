use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stemsplit_core::job::DEFAULT_ENGINE;

use crate::registry::DEFAULT_RETIRED_CAPACITY;

/// Default time a submitted job may wait for `start`.
const DEFAULT_UNSTARTED_TTL_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {var}: '{value}'")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Pipeline configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where uploaded inputs are stored (default: `./uploads`).
    pub upload_dir: PathBuf,
    /// Where stems and archives are written (default: `./outputs`).
    pub output_dir: PathBuf,
    /// Device labels, e.g. `cuda:0`. Empty means a single CPU device.
    pub devices: Vec<String>,
    /// Concurrent leases per device (default: `1`).
    pub slots_per_device: usize,
    /// Give up waiting for a device after this long. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Per-subscriber progress buffer (default: `256`).
    pub event_buffer: usize,
    /// Engine used when a submission does not name one.
    pub default_engine: String,
    /// Cap on concurrently running jobs. `None` is unbounded.
    pub max_running_jobs: Option<usize>,
    /// Retired jobs kept for status queries (default: `1024`).
    pub retired_job_capacity: usize,
    /// Submitted jobs not started within this long are failed and their
    /// uploads removed (default: one hour). `None` keeps them forever.
    pub unstarted_job_ttl: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("./uploads"),
            output_dir: PathBuf::from("./outputs"),
            devices: Vec::new(),
            slots_per_device: 1,
            acquire_timeout: None,
            event_buffer: stemsplit_events::bus::DEFAULT_CAPACITY,
            default_engine: DEFAULT_ENGINE.to_string(),
            max_running_jobs: None,
            retired_job_capacity: DEFAULT_RETIRED_CAPACITY,
            unstarted_job_ttl: Some(Duration::from_secs(DEFAULT_UNSTARTED_TTL_SECS)),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default            |
    /// |--------------------------|--------------------|
    /// | `UPLOAD_DIR`             | `./uploads`        |
    /// | `OUTPUT_DIR`             | `./outputs`        |
    /// | `DEVICES`                | (cpu)              |
    /// | `DEVICE_SLOTS`           | `1`                |
    /// | `ACQUIRE_TIMEOUT_SECS`   | `0` (none)         |
    /// | `EVENT_BUFFER`           | `256`              |
    /// | `DEFAULT_ENGINE`         | `mid-side`         |
    /// | `MAX_RUNNING_JOBS`       | `0` (none)         |
    /// | `RETIRED_JOB_CAPACITY`   | `1024`             |
    /// | `UNSTARTED_JOB_TTL_SECS` | `3600` (`0`: none) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` uses the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let upload_dir = lookup("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);
        let output_dir = lookup("OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        let devices = lookup("DEVICES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let slots_per_device = parse(&lookup, "DEVICE_SLOTS", defaults.slots_per_device)?;
        let acquire_timeout_secs: u64 = parse(&lookup, "ACQUIRE_TIMEOUT_SECS", 0)?;
        let event_buffer = parse(&lookup, "EVENT_BUFFER", defaults.event_buffer)?;
        let default_engine = lookup("DEFAULT_ENGINE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_engine);
        let max_running_jobs: usize = parse(&lookup, "MAX_RUNNING_JOBS", 0)?;
        let retired_job_capacity =
            parse(&lookup, "RETIRED_JOB_CAPACITY", defaults.retired_job_capacity)?;
        let unstarted_ttl_secs: u64 =
            parse(&lookup, "UNSTARTED_JOB_TTL_SECS", DEFAULT_UNSTARTED_TTL_SECS)?;

        Ok(Self {
            upload_dir,
            output_dir,
            devices,
            slots_per_device: slots_per_device.max(1),
            acquire_timeout: (acquire_timeout_secs > 0)
                .then(|| Duration::from_secs(acquire_timeout_secs)),
            event_buffer: event_buffer.max(1),
            default_engine,
            max_running_jobs: (max_running_jobs > 0).then_some(max_running_jobs),
            retired_job_capacity: retired_job_capacity.max(1),
            unstarted_job_ttl: (unstarted_ttl_secs > 0)
                .then(|| Duration::from_secs(unstarted_ttl_secs)),
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.slots_per_device, 1);
        assert_eq!(config.acquire_timeout, None);
        assert_eq!(config.max_running_jobs, None);
        assert_eq!(config.default_engine, DEFAULT_ENGINE);
        assert_eq!(config.unstarted_job_ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let config =
            PipelineConfig::from_lookup(lookup(&[("UNSTARTED_JOB_TTL_SECS", "0")])).unwrap();
        assert_eq!(config.unstarted_job_ttl, None);
    }

    #[test]
    fn parses_device_list_and_limits() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("DEVICES", "cuda:0, cuda:1,,"),
            ("DEVICE_SLOTS", "2"),
            ("ACQUIRE_TIMEOUT_SECS", "15"),
            ("MAX_RUNNING_JOBS", "4"),
        ]))
        .unwrap();
        assert_eq!(config.devices, vec!["cuda:0", "cuda:1"]);
        assert_eq!(config.slots_per_device, 2);
        assert_eq!(config.acquire_timeout, Some(Duration::from_secs(15)));
        assert_eq!(config.max_running_jobs, Some(4));
    }

    #[test]
    fn malformed_number_is_reported() {
        let result = PipelineConfig::from_lookup(lookup(&[("EVENT_BUFFER", "lots")]));
        assert_matches!(result, Err(ConfigError { var: "EVENT_BUFFER", .. }));
    }
}
