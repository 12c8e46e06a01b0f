use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ArStageError, Result};

/// Top-level configuration structure for the core subsystems.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transform: TransformConfig,
    pub recording: RecordingConfig,
    pub audio: AudioConfig,
}

impl AppConfig {
    /// Defaults for an interactive session.
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Loads a JSON configuration file. Missing sections fall back to their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(?path, "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.transform.validate()?;
        self.recording.validate()?;
        self.audio.validate()
    }
}

/// Bounds applied by the transform arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            min_scale: 0.1,
            max_scale: 10.0,
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            return Err(ArStageError::invalid("min_scale must be positive"));
        }
        if !(self.max_scale.is_finite() && self.max_scale >= self.min_scale) {
            return Err(ArStageError::invalid(
                "max_scale must be finite and not below min_scale",
            ));
        }
        Ok(())
    }
}

/// How frame sampling is driven while a recording is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    /// A dedicated thread ticks at the requested frame rate.
    Timer,
    /// The host's render loop drives sampling through `on_render_tick`.
    RenderLoop,
}

/// Configuration specific to the recording pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub default_fps: u32,
    pub max_fps: u32,
    /// Capacity of the bounded queue between producers and the mux worker.
    pub queue_capacity: usize,
    /// Items one stream may buffer while the other stream has nothing queued.
    pub max_interleave_lag: usize,
    pub finalize_timeout_ms: u64,
    pub sampling: SamplingMode,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            default_fps: 30,
            max_fps: 120,
            queue_capacity: 64,
            max_interleave_lag: 16,
            finalize_timeout_ms: 2_000,
            sampling: SamplingMode::Timer,
        }
    }
}

impl RecordingConfig {
    /// Upper bound on how long dispose waits for a container to finalize.
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_fps == 0 || self.default_fps > self.max_fps {
            return Err(ArStageError::invalid(
                "default_fps must be between 1 and max_fps",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ArStageError::invalid("queue_capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Length of each delivered buffer in milliseconds.
    pub buffer_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 1,
            buffer_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.buffer_ms == 0 {
            return Err(ArStageError::invalid(
                "audio sample_rate, channels and buffer_ms must be non-zero",
            ));
        }
        Ok(())
    }
}
