//! Frame buffers and the rasterization seam used by the recorder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{audio::AudioBuffer, ArStageError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Tightly packed RGBA8 image, rows top to bottom.
#[derive(Clone, PartialEq, Eq)]
pub struct VideoFrame {
    size: FrameSize,
    pixels: Vec<u8>,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame").field("size", &self.size).finish()
    }
}

impl VideoFrame {
    /// Wraps tightly packed RGBA rows; the length must match `size`.
    pub fn new(size: FrameSize, pixels: Vec<u8>) -> Result<Self> {
        if pixels.len() != size.pixel_count() * 4 {
            return Err(ArStageError::invalid(format!(
                "expected {} bytes for a {}x{} RGBA frame, got {}",
                size.pixel_count() * 4,
                size.width,
                size.height,
                pixels.len()
            )));
        }
        Ok(Self { size, pixels })
    }

    pub fn filled(size: FrameSize, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take(size.pixel_count() * 4)
            .collect();
        Self { size, pixels }
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// RGBA at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        let at = (y as usize * self.size.width as usize + x as usize) * 4;
        let mut out = [0; 4];
        out.copy_from_slice(&self.pixels[at..at + 4]);
        Some(out)
    }

    /// Nearest-neighbour rescale to `target`.
    pub fn scaled(&self, target: FrameSize) -> Self {
        if target == self.size || target.is_empty() || self.size.is_empty() {
            return self.clone();
        }
        let mut pixels = Vec::with_capacity(target.pixel_count() * 4);
        for y in 0..target.height {
            let src_y = (y as u64 * self.size.height as u64 / target.height as u64) as u32;
            for x in 0..target.width {
                let src_x = (x as u64 * self.size.width as u64 / target.width as u64) as u32;
                let at = (src_y as usize * self.size.width as usize + src_x as usize) * 4;
                pixels.extend_from_slice(&self.pixels[at..at + 4]);
            }
        }
        Self {
            size: target,
            pixels,
        }
    }

    /// Center crop to `target`. Dimensions larger than the source are kept at
    /// the source size.
    pub fn cropped(&self, target: FrameSize) -> Self {
        let width = target.width.min(self.size.width);
        let height = target.height.min(self.size.height);
        if width == self.size.width && height == self.size.height {
            return self.clone();
        }
        let left = (self.size.width - width) / 2;
        let top = (self.size.height - height) / 2;
        let stride = self.size.width as usize * 4;
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for y in top..top + height {
            let start = y as usize * stride + left as usize * 4;
            pixels.extend_from_slice(&self.pixels[start..start + width as usize * 4]);
        }
        Self {
            size: FrameSize::new(width, height),
            pixels,
        }
    }
}

/// How captured frames are reshaped before encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResizePolicy {
    #[default]
    Original,
    Scale { size: FrameSize },
    Crop { size: FrameSize },
}

impl ResizePolicy {
    pub fn apply(&self, frame: VideoFrame) -> VideoFrame {
        match self {
            ResizePolicy::Original => frame,
            ResizePolicy::Scale { size } => frame.scaled(*size),
            ResizePolicy::Crop { size } => frame.cropped(*size),
        }
    }

    /// Output size when it is known before the first frame arrives.
    pub fn fixed_size(&self) -> Option<FrameSize> {
        match self {
            ResizePolicy::Original | ResizePolicy::Crop { .. } => None,
            ResizePolicy::Scale { size } => Some(*size),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ResizePolicy::Scale { size } | ResizePolicy::Crop { size } if size.is_empty() => Err(
                ArStageError::invalid("resize target must have non-zero dimensions"),
            ),
            _ => Ok(()),
        }
    }
}

/// Rasterizes whatever the renderer presented last.
pub trait FrameSource: Send + Sync {
    /// Returns `None` when no frame has been rendered yet.
    fn rasterize(&self) -> Option<VideoFrame>;
}

/// Video frame stamped against the recording clock.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub timestamp: Duration,
    pub frame: VideoFrame,
}

/// Audio buffer stamped against the recording clock at its first sample.
#[derive(Debug, Clone)]
pub struct TimedAudio {
    pub timestamp: Duration,
    pub buffer: AudioBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> VideoFrame {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        VideoFrame::new(FrameSize::new(width, height), pixels).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let err = VideoFrame::new(FrameSize::new(2, 2), vec![0; 15]).unwrap_err();
        assert!(format!("{err}").contains("16 bytes"));
    }

    #[test]
    fn scaling_samples_nearest_pixels() {
        let frame = gradient(4, 4).scaled(FrameSize::new(2, 2));
        assert_eq!(frame.size(), FrameSize::new(2, 2));
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0, 255]));
        assert_eq!(frame.pixel(1, 1), Some([2, 2, 0, 255]));
    }

    #[test]
    fn cropping_keeps_the_center() {
        let frame = gradient(6, 4).cropped(FrameSize::new(2, 2));
        assert_eq!(frame.size(), FrameSize::new(2, 2));
        assert_eq!(frame.pixel(0, 0), Some([2, 1, 0, 255]));
        assert_eq!(frame.pixel(1, 1), Some([3, 2, 0, 255]));
    }

    #[test]
    fn crop_never_grows_the_frame() {
        let frame = gradient(3, 3).cropped(FrameSize::new(8, 2));
        assert_eq!(frame.size(), FrameSize::new(3, 2));
    }

    #[test]
    fn empty_resize_targets_are_invalid() {
        let policy = ResizePolicy::Scale {
            size: FrameSize::new(0, 10),
        };
        assert!(policy.validate().is_err());
        assert!(ResizePolicy::Original.validate().is_ok());
    }
}
