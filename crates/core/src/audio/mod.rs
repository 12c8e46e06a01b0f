use std::{
    f32::consts::PI,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{ArStageError, AudioConfig, Result};

/// Layout of the 16-bit PCM delivered by an audio input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes per interleaved sample frame.
    pub fn block_align(&self) -> u32 {
        self.channels as u32 * 2
    }

    /// Bytes per second of 16-bit interleaved PCM.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align()
    }
}

impl From<&AudioConfig> for AudioFormat {
    fn from(config: &AudioConfig) -> Self {
        Self::new(config.sample_rate, config.channels)
    }
}

/// Interleaved signed 16-bit samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub format: AudioFormat,
    pub samples: Vec<i16>,
}

impl AudioBuffer {
    /// Fails unless `samples` holds whole frames for `format`.
    pub fn new(format: AudioFormat, samples: Vec<i16>) -> Result<Self> {
        if format.channels == 0 || samples.len() % format.channels as usize != 0 {
            return Err(ArStageError::invalid(
                "audio buffer length must be a multiple of the channel count",
            ));
        }
        Ok(Self { format, samples })
    }

    pub fn silence(format: AudioFormat, frames: usize) -> Self {
        Self {
            format,
            samples: vec![0; frames * format.channels as usize],
        }
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.format.sample_rate.max(1) as f64)
    }

    /// Samples as little-endian PCM bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect()
    }

    /// Root-mean-square level normalised to [0, 1].
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .samples
            .iter()
            .map(|sample| {
                let value = *sample as f32 / i16::MAX as f32;
                value * value
            })
            .sum();
        (sum / self.samples.len() as f32).sqrt()
    }
}

/// Receives buffers from an audio tap, on the tap's own thread.
pub type AudioSink = Arc<dyn Fn(AudioBuffer) + Send + Sync>;

/// A live audio input such as the microphone.
pub trait AudioInput: Send + Sync {
    fn format(&self) -> AudioFormat;

    /// Starts delivering buffers to `sink` until the returned tap is stopped.
    fn start(&self, sink: AudioSink) -> Result<Box<dyn AudioTap>>;
}

/// Handle for a running audio delivery.
pub trait AudioTap: Send {
    /// Stops delivery. No buffer reaches the sink after this returns.
    fn stop(&mut self);
}

/// Synthetic input producing a sine tone in real time.
#[derive(Debug, Clone)]
pub struct ToneInput {
    format: AudioFormat,
    frequency: f32,
    buffer: Duration,
}

impl ToneInput {
    pub fn new(config: &AudioConfig, frequency: f32) -> Self {
        Self {
            format: AudioFormat::from(config),
            frequency,
            buffer: Duration::from_millis(config.buffer_ms as u64),
        }
    }
}

impl AudioInput for ToneInput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn start(&self, sink: AudioSink) -> Result<Box<dyn AudioTap>> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let format = self.format;
        let frequency = self.frequency;
        let period = self.buffer;
        let frames_per_buffer =
            ((format.sample_rate as u64 * period.as_millis() as u64) / 1_000).max(1) as usize;

        let handle = std::thread::Builder::new()
            .name("ar-stage-tone".into())
            .spawn(move || {
                let mut phase = 0usize;
                while flag.load(Ordering::Acquire) {
                    std::thread::sleep(period);
                    if !flag.load(Ordering::Acquire) {
                        break;
                    }
                    let mut samples =
                        Vec::with_capacity(frames_per_buffer * format.channels as usize);
                    for _ in 0..frames_per_buffer {
                        let t = phase as f32 / format.sample_rate as f32;
                        let value = ((2.0 * PI * frequency * t).sin() * 0.25 * i16::MAX as f32)
                            as i16;
                        for _ in 0..format.channels {
                            samples.push(value);
                        }
                        phase += 1;
                    }
                    sink(AudioBuffer { format, samples });
                }
            })?;

        tracing::debug!(frequency, ?format, "tone input started");
        Ok(Box::new(ToneTap {
            running,
            handle: Some(handle),
        }))
    }
}

struct ToneTap {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioTap for ToneTap {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("tone input thread panicked");
            }
        }
    }
}

impl Drop for ToneTap {
    fn drop(&mut self) {
        self.stop();
    }
}
