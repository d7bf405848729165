//! Separation engine collaborator and the built-in mid/side engine.
//!
//! A [`SeparationEngine`] is opaque inference: it takes a decoded stereo
//! buffer plus the leased device and returns one [`Stem`] per source it
//! declares. Engines are constructed by an [`EngineLoader`] and memoized
//! by [`crate::ModelCache`].

use std::sync::Arc;

use crate::device::Device;
use crate::media::AudioBuffer;

/// Name of the built-in engine.
pub const MID_SIDE_ENGINE: &str = "mid-side";

/// One separated component of an input.
#[derive(Debug, Clone, PartialEq)]
pub struct Stem {
    /// Source name (e.g. `"vocals"`); names the output file.
    pub name: String,
    pub audio: AudioBuffer,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineLoadError {
    #[error("Unknown engine: {0}")]
    UnknownEngine(String),

    #[error("Failed to load engine '{name}': {reason}")]
    Failed { name: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("Inference failed: {0}")]
pub struct InferenceError(pub String);

/// Blocking separation over one decoded input.
pub trait SeparationEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Sample rate the engine expects, or `None` if it accepts any.
    fn sample_rate(&self) -> Option<u32>;

    /// Source names in declaration order.
    fn sources(&self) -> &[String];

    fn separate(&self, audio: &AudioBuffer, device: &Device) -> Result<Vec<Stem>, InferenceError>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn SeparationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeparationEngine").field("name", &self.name()).finish()
    }
}

/// Constructs engines by name. Loading is blocking and may be slow.
pub trait EngineLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<Arc<dyn SeparationEngine>, EngineLoadError>;
}

// ---------------------------------------------------------------------------
// Built-in engine
// ---------------------------------------------------------------------------

/// Splits a stereo signal into its center (mid) and side components.
///
/// `center` holds `(L + R) / 2` on both channels; `sides` holds
/// `(L - R) / 2` on the left and its negation on the right. Summing the
/// two stems reconstructs the input.
pub struct MidSideEngine {
    sources: Vec<String>,
}

impl MidSideEngine {
    pub fn new() -> Self {
        Self {
            sources: vec!["center".to_string(), "sides".to_string()],
        }
    }
}

impl Default for MidSideEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SeparationEngine for MidSideEngine {
    fn name(&self) -> &str {
        MID_SIDE_ENGINE
    }

    fn sample_rate(&self) -> Option<u32> {
        None
    }

    fn sources(&self) -> &[String] {
        &self.sources
    }

    fn separate(&self, audio: &AudioBuffer, device: &Device) -> Result<Vec<Stem>, InferenceError> {
        let [left, right] = audio.channels.as_slice() else {
            return Err(InferenceError(format!(
                "expected 2 channels, got {}",
                audio.channel_count()
            )));
        };
        if left.len() != right.len() {
            return Err(InferenceError("channel lengths differ".to_string()));
        }
        tracing::trace!(device = %device, frames = left.len(), "Mid/side separation");

        let mid: Vec<f32> = left.iter().zip(right).map(|(l, r)| (l + r) * 0.5).collect();
        let side: Vec<f32> = left.iter().zip(right).map(|(l, r)| (l - r) * 0.5).collect();
        let side_inverted: Vec<f32> = side.iter().map(|s| -s).collect();

        Ok(vec![
            Stem {
                name: self.sources[0].clone(),
                audio: AudioBuffer::new(audio.sample_rate, vec![mid.clone(), mid]),
            },
            Stem {
                name: self.sources[1].clone(),
                audio: AudioBuffer::new(audio.sample_rate, vec![side, side_inverted]),
            },
        ])
    }
}

/// Loader that knows only the engines compiled into this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngineLoader;

impl EngineLoader for BuiltinEngineLoader {
    fn load(&self, name: &str) -> Result<Arc<dyn SeparationEngine>, EngineLoadError> {
        match name {
            MID_SIDE_ENGINE => Ok(Arc::new(MidSideEngine::new())),
            other => Err(EngineLoadError::UnknownEngine(other.to_string())),
        }
    }
}
