//! Synthetic stand-ins for the tracking engine, renderer and video decoder.

use std::{sync::Arc, time::Duration};

use ar_stage_core::{
    capture::{FrameSize, FrameSource, VideoFrame},
    video::{DecodePoll, SurfaceMaterial, VideoDecoder},
    NodeId, Result, SceneStore,
};
use parking_lot::Mutex;

/// Latest colour shown by the video-textured surface.
pub type TextureSlot = Arc<Mutex<Option<[u8; 4]>>>;

/// Decoder producing a short clip that cycles through a colour ramp.
#[derive(Debug)]
pub struct RampDecoder {
    fps: u32,
    length: u64,
    origin: Option<Duration>,
    next: u64,
}

impl RampDecoder {
    pub fn new(fps: u32, length: u64) -> Self {
        Self {
            fps: fps.max(1),
            length,
            origin: None,
            next: 0,
        }
    }
}

impl VideoDecoder for RampDecoder {
    fn poll_frame(&mut self, host_time: Duration) -> DecodePoll {
        let origin = *self.origin.get_or_insert(host_time);
        let due = (host_time.saturating_sub(origin).as_secs_f64() * self.fps as f64) as u64;
        if self.next >= self.length {
            return DecodePoll::EndOfStream;
        }
        if due < self.next {
            return DecodePoll::Pending;
        }
        let shade = (self.next * 255 / self.length.max(1)) as u8;
        self.next += 1;
        DecodePoll::Frame(VideoFrame::filled(
            FrameSize::new(2, 2),
            [shade, 64, 255 - shade, 255],
        ))
    }

    fn rewind(&mut self) -> Result<()> {
        self.origin = None;
        self.next = 0;
        Ok(())
    }

    fn release(&mut self) {
        tracing::debug!("ramp decoder released");
    }
}

/// Material that remembers the colour of the last presented frame.
#[derive(Debug)]
pub struct ColourMaterial(pub TextureSlot);

impl SurfaceMaterial for ColourMaterial {
    fn present(&mut self, frame: &VideoFrame) {
        *self.0.lock() = frame.pixel(0, 0);
    }

    fn clear(&mut self) {
        *self.0.lock() = None;
    }
}

/// Renders a top-down view: the textured node drawn as a square whose
/// position and size follow its scene transform.
pub struct TopDownRasterizer {
    scene: Arc<SceneStore>,
    node: NodeId,
    texture: TextureSlot,
    size: FrameSize,
    /// Pixels per metre.
    zoom: f32,
}

impl TopDownRasterizer {
    pub fn new(scene: Arc<SceneStore>, node: NodeId, texture: TextureSlot, size: FrameSize) -> Self {
        Self {
            scene,
            node,
            texture,
            size,
            zoom: size.height as f32 / 2.0,
        }
    }
}

impl FrameSource for TopDownRasterizer {
    fn rasterize(&self) -> Option<VideoFrame> {
        let mut frame = vec![0u8; self.size.pixel_count() * 4];
        for pixel in frame.chunks_exact_mut(4) {
            pixel.copy_from_slice(&[24, 24, 32, 255]);
        }

        if let Some(transform) = self.scene.transform(self.node) {
            let colour = (*self.texture.lock()).unwrap_or([220, 220, 220, 255]);
            let centre_x = self.size.width as f32 / 2.0 + transform.translation.x * self.zoom;
            let centre_y = self.size.height as f32 / 2.0 + transform.translation.z * self.zoom;
            let half = (0.05 * transform.scale.x * self.zoom).max(1.0);

            let x0 = (centre_x - half).max(0.0) as u32;
            let x1 = ((centre_x + half).max(0.0) as u32).min(self.size.width);
            let y0 = (centre_y - half).max(0.0) as u32;
            let y1 = ((centre_y + half).max(0.0) as u32).min(self.size.height);
            for y in y0..y1 {
                for x in x0..x1 {
                    let at = (y as usize * self.size.width as usize + x as usize) * 4;
                    frame[at..at + 4].copy_from_slice(&colour);
                }
            }
        }

        VideoFrame::new(self.size, frame).ok()
    }
}

#[cfg(test)]
mod tests {
    use ar_stage_core::{SceneGraph, Transform};
    use glam::Vec3;

    use super::*;

    #[test]
    fn ramp_ends_after_its_length() {
        let mut decoder = RampDecoder::new(10, 2);
        assert!(matches!(decoder.poll_frame(Duration::ZERO), DecodePoll::Frame(_)));
        assert!(matches!(decoder.poll_frame(Duration::from_millis(50)), DecodePoll::Pending));
        assert!(matches!(decoder.poll_frame(Duration::from_millis(100)), DecodePoll::Frame(_)));
        assert!(matches!(decoder.poll_frame(Duration::from_millis(200)), DecodePoll::EndOfStream));

        decoder.rewind().unwrap();
        assert!(matches!(decoder.poll_frame(Duration::from_secs(5)), DecodePoll::Frame(_)));
    }

    #[test]
    fn rasterizer_draws_the_node_with_the_texture_colour() {
        let scene = Arc::new(SceneStore::new());
        scene.set_transform(NodeId(1), &Transform::IDENTITY);
        let texture: TextureSlot = Arc::new(Mutex::new(Some([255, 0, 0, 255])));
        let rasterizer = TopDownRasterizer::new(scene.clone(), NodeId(1), texture, FrameSize::new(40, 40));

        let frame = rasterizer.rasterize().unwrap();
        assert_eq!(frame.pixel(20, 20), Some([255, 0, 0, 255]));
        assert_eq!(frame.pixel(0, 0), Some([24, 24, 32, 255]));

        scene.set_transform(
            NodeId(1),
            &Transform {
                translation: Vec3::new(0.5, 0.0, 0.0),
                ..Transform::IDENTITY
            },
        );
        let frame = rasterizer.rasterize().unwrap();
        assert_eq!(frame.pixel(20, 20), Some([24, 24, 32, 255]));
        assert_eq!(frame.pixel(30, 20), Some([255, 0, 0, 255]));
    }
}
