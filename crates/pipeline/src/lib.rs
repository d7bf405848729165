//! Job orchestration engine for stem separation.
//!
//! - [`ModelCache`]: lazily loaded, memoized separation engines.
//! - [`DeviceArbiter`]: fair, capacity-bounded leasing of compute devices.
//! - [`JobRegistry`]: live and recently retired jobs.
//! - [`Orchestrator`]: drives one job from `Queued` to a terminal state.
//! - [`ResultPackager`]: deterministic zip archive of a job's stems.
//! - [`JobService`]: the facade the API layer talks to.
//!
//! Decoding, inference and encoding are external collaborators behind the
//! [`media`] and [`engine`] traits; built-in WAV and mid/side
//! implementations make the service usable without a model runtime.

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod media;
pub mod model_cache;
pub mod orchestrator;
pub mod packager;
pub mod registry;
pub mod service;

pub use config::{ConfigError, PipelineConfig};
pub use device::{
    AcquireError, Device, DeviceArbiter, DeviceKind, DeviceLease, DevicePurge, DeviceSlotStatus,
    DeviceStatus,
};
pub use engine::{
    BuiltinEngineLoader, EngineLoadError, EngineLoader, InferenceError, MidSideEngine,
    SeparationEngine, Stem,
};
pub use error::{FileError, JobError, ServiceError};
pub use media::{AudioBuffer, AudioDecoder, MediaError, StemEncoder, WavDecoder, WavEncoder};
pub use model_cache::ModelCache;
pub use orchestrator::Orchestrator;
pub use packager::{PackagingError, ResultPackager};
pub use registry::{CancelOutcome, Job, JobControl, JobRegistry, JobSummary};
pub use service::{Collaborators, JobService};
