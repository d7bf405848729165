//! Decode / encode collaborators and the planar audio buffer they exchange.
//!
//! Implementations are blocking; the orchestrator calls them from
//! `tokio::task::spawn_blocking`.

use std::path::Path;

/// Planar floating-point audio, samples in `-1.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    /// One `Vec` per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Normalize the layout to stereo: mono is duplicated, anything wider
    /// keeps its first two channels.
    pub fn into_stereo(mut self) -> Self {
        match self.channels.len() {
            1 => {
                let mono = self.channels[0].clone();
                self.channels.push(mono);
            }
            n if n > 2 => self.channels.truncate(2),
            _ => {}
        }
        self
    }

    /// Multiply every sample by `gain`, clamping to the valid range.
    pub fn apply_gain(&mut self, gain: f32) {
        if (gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        for channel in &mut self.channels {
            for sample in channel.iter_mut() {
                *sample = (*sample * gain).clamp(-1.0, 1.0);
            }
        }
    }
}

/// Errors raised by decode / encode collaborators.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported audio: {0}")]
    Unsupported(String),
}

/// Turns an input file into an [`AudioBuffer`].
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<AudioBuffer, MediaError>;
}

/// Writes one stem to disk and returns the written size in bytes.
pub trait StemEncoder: Send + Sync {
    fn encode(&self, audio: &AudioBuffer, dest: &Path) -> Result<u64, MediaError>;

    /// File extension (without the dot) for encoded stems.
    fn extension(&self) -> &str;
}

// ---------------------------------------------------------------------------
// WAV implementations
// ---------------------------------------------------------------------------

/// Decodes integer and float PCM WAV files and up-mixes them to stereo.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoder;

impl AudioDecoder for WavDecoder {
    fn decode(&self, path: &Path) -> Result<AudioBuffer, MediaError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channel_count = usize::from(spec.channels);
        if channel_count == 0 {
            return Err(MediaError::Unsupported("zero channels".to_string()));
        }

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                    return Err(MediaError::Unsupported(format!(
                        "{} bits per sample",
                        spec.bits_per_sample
                    )));
                }
                let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()?
            }
        };

        if interleaved.is_empty() {
            return Err(MediaError::Unsupported("file contains no samples".to_string()));
        }

        let mut channels = vec![Vec::with_capacity(interleaved.len() / channel_count); channel_count];
        for frame in interleaved.chunks_exact(channel_count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }

        Ok(AudioBuffer::new(spec.sample_rate, channels).into_stereo())
    }
}

/// Writes 16-bit PCM WAV files.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavEncoder;

impl StemEncoder for WavEncoder {
    fn encode(&self, audio: &AudioBuffer, dest: &Path) -> Result<u64, MediaError> {
        let channels = u16::try_from(audio.channel_count())
            .map_err(|_| MediaError::Unsupported("too many channels".to_string()))?;
        if channels == 0 {
            return Err(MediaError::Unsupported("zero channels".to_string()));
        }
        let spec = hound::WavSpec {
            channels,
            sample_rate: audio.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(dest, spec)?;
        for frame in 0..audio.frames() {
            for channel in &audio.channels {
                let sample = channel.get(frame).copied().unwrap_or(0.0).clamp(-1.0, 1.0);
                writer.write_sample((sample * f32::from(i16::MAX)) as i16)?;
            }
        }
        writer.finalize()?;

        Ok(std::fs::metadata(dest)?.len())
    }

    fn extension(&self) -> &str {
        "wav"
    }
}
