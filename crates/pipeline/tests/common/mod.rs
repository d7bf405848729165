#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stemsplit_core::job::{InputFile, JobSettings};
use stemsplit_core::progress::{EventKind, ProgressEvent};
use stemsplit_core::types::JobId;
use stemsplit_events::Subscription;
use stemsplit_pipeline::{
    AudioBuffer, AudioDecoder, Collaborators, Device, EngineLoadError, EngineLoader,
    InferenceError, JobService, MediaError, PipelineConfig, SeparationEngine, Stem, StemEncoder,
};
use tokio::sync::mpsc;

/// First sample value that makes [`ScriptedEngine`] fail.
pub const FAIL_MARKER: f32 = 0.5;

/// Upper bound for any single test wait.
pub const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

/// Decodes without touching the disk. Inputs named `*fail*` decode to a
/// buffer carrying [`FAIL_MARKER`]; inputs named `*corrupt*` fail to decode.
pub struct FakeDecoder;

impl AudioDecoder for FakeDecoder {
    fn decode(&self, path: &Path) -> Result<AudioBuffer, MediaError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.contains("corrupt") {
            return Err(MediaError::Unsupported("corrupt header".to_string()));
        }
        let first = if name.contains("fail") { FAIL_MARKER } else { 0.1 };
        Ok(AudioBuffer::new(
            44100,
            vec![vec![first, 0.2, 0.3], vec![first, 0.2, 0.3]],
        ))
    }
}

/// Writes one byte per frame and channel.
pub struct FakeEncoder;

impl StemEncoder for FakeEncoder {
    fn encode(&self, audio: &AudioBuffer, dest: &Path) -> Result<u64, MediaError> {
        let bytes = vec![0u8; audio.frames() * audio.channel_count()];
        std::fs::write(dest, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn extension(&self) -> &str {
        "wav"
    }
}

/// Engine with two sources that fails on [`FAIL_MARKER`] input, sleeps
/// for `delay`, tracks concurrent calls and can be held at a gate.
pub struct ScriptedEngine {
    sources: Vec<String>,
    delay: Duration,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
    pub calls: AtomicUsize,
    gate: Option<Gate>,
}

/// Lets a test observe an inference call start and decide when it ends.
pub struct Gate {
    entered: mpsc::UnboundedSender<usize>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

/// Test-side handle of a [`Gate`].
pub struct GateHandle {
    pub entered: mpsc::UnboundedReceiver<usize>,
    pub release: std::sync::mpsc::Sender<()>,
}

impl GateHandle {
    /// Wait until inference call number `call` (0-based) has started.
    pub async fn wait_for_call(&mut self, call: usize) {
        loop {
            let seen = tokio::time::timeout(WAIT, self.entered.recv())
                .await
                .expect("inference call did not start in time")
                .expect("gate closed");
            if seen == call {
                return;
            }
        }
    }

    pub fn release_one(&self) {
        self.release.send(()).unwrap();
    }
}

impl ScriptedEngine {
    pub fn new(delay: Duration) -> Self {
        Self {
            sources: vec!["vocals".to_string(), "accompaniment".to_string()],
            delay,
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated() -> (Self, GateHandle) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let mut engine = Self::new(Duration::ZERO);
        engine.gate = Some(Gate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        (
            engine,
            GateHandle {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl SeparationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn sample_rate(&self) -> Option<u32> {
        Some(44100)
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn separate(&self, audio: &AudioBuffer, _device: &Device) -> Result<Vec<Stem>, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(call);
            let _ = gate.release.lock().unwrap().recv();
        }
        std::thread::sleep(self.delay);
        self.active.fetch_sub(1, Ordering::SeqCst);

        if audio.channels[0][0] == FAIL_MARKER {
            return Err(InferenceError("model produced NaNs".to_string()));
        }
        Ok(self
            .sources
            .iter()
            .map(|name| Stem {
                name: name.clone(),
                audio: audio.clone(),
            })
            .collect())
    }
}

/// Serves one shared engine under any name and counts loads.
pub struct SharedLoader {
    pub engine: Arc<ScriptedEngine>,
    pub loads: AtomicUsize,
}

impl SharedLoader {
    pub fn new(engine: Arc<ScriptedEngine>) -> Self {
        Self {
            engine,
            loads: AtomicUsize::new(0),
        }
    }
}

impl EngineLoader for SharedLoader {
    fn load(&self, name: &str) -> Result<Arc<dyn SeparationEngine>, EngineLoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if name == "missing" {
            return Err(EngineLoadError::UnknownEngine(name.to_string()));
        }
        Ok(self.engine.clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub service: JobService,
    pub engine: Arc<ScriptedEngine>,
    pub loader: Arc<SharedLoader>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self::with_config(engine, |_| {})
    }

    pub fn with_config(engine: ScriptedEngine, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig {
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("outputs"),
            ..Default::default()
        };
        tweak(&mut config);

        let engine = Arc::new(engine);
        let loader = Arc::new(SharedLoader::new(Arc::clone(&engine)));
        let service = JobService::new(
            config,
            Collaborators {
                decoder: Arc::new(FakeDecoder),
                encoder: Arc::new(FakeEncoder),
                loader: loader.clone(),
                purge: None,
            },
        );

        Self {
            service,
            engine,
            loader,
            dir,
        }
    }

    pub fn inputs(&self, names: &[&str]) -> Vec<InputFile> {
        names
            .iter()
            .map(|n| InputFile::new(*n, self.dir.path().join("uploads").join(n)))
            .collect()
    }

    pub fn settings(&self) -> JobSettings {
        JobSettings {
            engine: "scripted".to_string(),
            ..Default::default()
        }
    }

    /// Submit, subscribe, start: the subscriber sees every event.
    pub fn submit_and_start(&self, names: &[&str]) -> (JobId, Subscription) {
        self.submit_and_start_with(names, self.settings())
    }

    pub fn submit_and_start_with(
        &self,
        names: &[&str],
        settings: JobSettings,
    ) -> (JobId, Subscription) {
        let job_id = self.service.submit(self.inputs(names), settings).unwrap();
        let sub = self.service.subscribe(job_id).unwrap();
        self.service.start(job_id).unwrap();
        (job_id, sub)
    }
}

/// Drain a subscription until it ends.
pub async fn collect(mut sub: Subscription) -> Vec<ProgressEvent> {
    tokio::time::timeout(WAIT, async move {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("job did not finish in time")
}

pub fn count(events: &[ProgressEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}
