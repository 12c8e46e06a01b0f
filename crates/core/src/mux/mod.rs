//! Output container writing.
//!
//! - [`Interleaver`] orders stamped video and audio into one timestamp-ordered
//!   sequence.
//! - [`MediaWriter`] is the container seam; [`AviWriter`] writes an AVI with
//!   uncompressed video and PCM audio that common players open directly.
//! - Sizes and counts unknown at start are written as placeholders and
//!   patched in `finalize`.

pub mod avi;
pub mod interleave;
pub mod riff;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    audio::{AudioBuffer, AudioFormat},
    capture::{FrameSize, VideoFrame},
    Result,
};

pub use avi::AviWriter;
pub use interleave::{Interleaver, MuxItem};

/// Streams a container is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackLayout {
    pub fps: u32,
    /// Output frame size when known up front; otherwise the first frame
    /// decides.
    pub frame_size: Option<FrameSize>,
    pub audio: Option<AudioFormat>,
}

/// What ended up in a finalized container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxSummary {
    pub path: PathBuf,
    /// Frames carrying image data.
    pub video_frames: u64,
    /// Empty chunks inserted to hold the previous image across gaps.
    pub repeated_frames: u64,
    /// Frames dropped because they arrived earlier than their slot.
    pub skipped_frames: u64,
    pub audio_chunks: u64,
    pub audio_bytes: u64,
    pub duration: Duration,
}

/// A container being written. Calls arrive in the order produced by the
/// [`Interleaver`].
pub trait MediaWriter: Send {
    fn write_video(&mut self, timestamp: Duration, frame: &VideoFrame) -> Result<()>;
    fn write_audio(&mut self, timestamp: Duration, buffer: &AudioBuffer) -> Result<()>;
    /// Completes the file so it is playable.
    fn finalize(self: Box<Self>) -> Result<MuxSummary>;
    /// Discards the output, removing any partial file.
    fn abort(self: Box<Self>);
}

/// Opens containers for the recorder.
pub trait ContainerFactory: Send + Sync {
    fn create(&self, path: &Path, layout: TrackLayout) -> Result<Box<dyn MediaWriter>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AviFactory;

impl ContainerFactory for AviFactory {
    fn create(&self, path: &Path, layout: TrackLayout) -> Result<Box<dyn MediaWriter>> {
        Ok(Box::new(AviWriter::create(path, layout)?))
    }
}
