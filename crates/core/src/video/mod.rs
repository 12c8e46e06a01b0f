//! Video playback into a 3D surface material.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{capture::VideoFrame, render::FrameListener, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
    Disposed,
}

/// Outcome of asking a decoder for the frame due at a render tick.
#[derive(Debug)]
pub enum DecodePoll {
    Frame(VideoFrame),
    /// Nothing new is ready; the material keeps its current frame.
    Pending,
    EndOfStream,
}

/// A decode session. Polling must not block.
pub trait VideoDecoder: Send {
    fn poll_frame(&mut self, host_time: Duration) -> DecodePoll;
    fn rewind(&mut self) -> Result<()>;
    fn release(&mut self);
}

/// Material property of a surface that displays decoded frames.
pub trait SurfaceMaterial: Send {
    fn present(&mut self, frame: &VideoFrame);
    /// Drops the frame buffer backing the material.
    fn clear(&mut self);
}

pub type EndOfStreamCallback = Box<dyn FnMut() + Send>;

struct SessionInner {
    decoder: Option<Box<dyn VideoDecoder>>,
    material: Option<Box<dyn SurfaceMaterial>>,
    state: PlaybackState,
    looping: bool,
    ended: bool,
    on_end: Option<EndOfStreamCallback>,
    loops: u64,
    presented: u64,
}

/// Plays a decoded video onto a surface material, driven by render ticks.
pub struct VideoTextureSession {
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for VideoTextureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VideoTextureSession")
            .field("state", &inner.state)
            .field("looping", &inner.looping)
            .field("loops", &inner.loops)
            .field("presented", &inner.presented)
            .finish()
    }
}

impl VideoTextureSession {
    pub fn new(
        decoder: Box<dyn VideoDecoder>,
        material: Box<dyn SurfaceMaterial>,
        looping: bool,
    ) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                decoder: Some(decoder),
                material: Some(material),
                state: PlaybackState::Stopped,
                looping,
                ended: false,
                on_end: None,
                loops: 0,
                presented: 0,
            }),
        }
    }

    /// Registers the callback fired when playback reaches a terminal end.
    pub fn on_end_of_stream(&self, callback: EndOfStreamCallback) {
        let mut inner = self.inner.lock();
        if inner.state != PlaybackState::Disposed {
            inner.on_end = Some(callback);
        }
    }

    pub fn play(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            PlaybackState::Playing | PlaybackState::Disposed => return Ok(()),
            PlaybackState::Stopped | PlaybackState::Paused => {}
        }
        if inner.ended {
            if let Some(decoder) = inner.decoder.as_mut() {
                decoder.rewind()?;
            }
            inner.ended = false;
        }
        inner.state = PlaybackState::Playing;
        tracing::debug!("video texture playing");
        Ok(())
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PlaybackState::Playing {
            inner.state = PlaybackState::Paused;
            tracing::debug!("video texture paused");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().state == PlaybackState::Playing
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    pub fn set_looping(&self, looping: bool) {
        self.inner.lock().looping = looping;
    }

    /// Times playback wrapped back to the start.
    pub fn loops_completed(&self) -> u64 {
        self.inner.lock().loops
    }

    pub fn frames_presented(&self) -> u64 {
        self.inner.lock().presented
    }

    /// Releases the decoder and the material's frame buffer. Safe to call
    /// repeatedly and from any state.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PlaybackState::Disposed {
            return;
        }
        if let Some(mut decoder) = inner.decoder.take() {
            decoder.release();
        }
        if let Some(mut material) = inner.material.take() {
            material.clear();
        }
        inner.on_end = None;
        inner.state = PlaybackState::Disposed;
        tracing::debug!("video texture disposed");
    }

    /// Advances playback by one render tick. Returns without doing anything
    /// when another thread holds the session.
    pub fn advance(&self, host_time: Duration) {
        let Some(mut guard) = self.inner.try_lock() else {
            tracing::trace!("video texture busy, skipping tick");
            return;
        };
        if guard.state != PlaybackState::Playing {
            return;
        }
        let inner = &mut *guard;
        let Some(decoder) = inner.decoder.as_mut() else {
            return;
        };

        match decoder.poll_frame(host_time) {
            DecodePoll::Frame(frame) => {
                if let Some(material) = inner.material.as_mut() {
                    material.present(&frame);
                    inner.presented += 1;
                }
                return;
            }
            DecodePoll::Pending => return,
            DecodePoll::EndOfStream => {}
        }

        if inner.looping {
            match decoder.rewind() {
                Ok(()) => {
                    inner.loops += 1;
                    tracing::trace!(loops = inner.loops, "video texture looped");
                    return;
                }
                Err(err) => tracing::warn!(%err, "rewind failed, ending playback"),
            }
        }

        inner.state = PlaybackState::Stopped;
        inner.ended = true;
        let callback = inner.on_end.take();
        drop(guard);
        self.fire_end(callback);
    }

    fn fire_end(&self, callback: Option<EndOfStreamCallback>) {
        let Some(mut callback) = callback else {
            return;
        };
        callback();
        let mut inner = self.inner.lock();
        if inner.on_end.is_none() && inner.state != PlaybackState::Disposed {
            inner.on_end = Some(callback);
        }
    }
}

impl FrameListener for VideoTextureSession {
    fn on_render_tick(&self, host_time: Duration) {
        self.advance(host_time);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::*;
    use crate::capture::FrameSize;

    #[derive(Clone, Copy)]
    enum Step {
        Frame(u8),
        Pending,
    }

    struct ScriptedDecoder {
        script: Vec<Step>,
        queue: VecDeque<Step>,
        released: Arc<AtomicUsize>,
    }

    impl ScriptedDecoder {
        fn new(script: Vec<Step>, released: Arc<AtomicUsize>) -> Self {
            Self {
                queue: script.iter().copied().collect(),
                script,
                released,
            }
        }
    }

    impl VideoDecoder for ScriptedDecoder {
        fn poll_frame(&mut self, _host_time: Duration) -> DecodePoll {
            match self.queue.pop_front() {
                Some(Step::Frame(shade)) => {
                    DecodePoll::Frame(VideoFrame::filled(FrameSize::new(1, 1), [shade; 4]))
                }
                Some(Step::Pending) => DecodePoll::Pending,
                None => DecodePoll::EndOfStream,
            }
        }

        fn rewind(&mut self) -> Result<()> {
            self.queue = self.script.iter().copied().collect();
            Ok(())
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MaterialLog {
        shown: Vec<u8>,
        cleared: usize,
    }

    struct RecordingMaterial(Arc<parking_lot::Mutex<MaterialLog>>);

    impl SurfaceMaterial for RecordingMaterial {
        fn present(&mut self, frame: &VideoFrame) {
            self.0.lock().shown.push(frame.pixels()[0]);
        }

        fn clear(&mut self) {
            self.0.lock().cleared += 1;
        }
    }

    struct Harness {
        session: VideoTextureSession,
        log: Arc<parking_lot::Mutex<MaterialLog>>,
        released: Arc<AtomicUsize>,
        ends: Arc<AtomicUsize>,
    }

    fn harness(script: Vec<Step>, looping: bool) -> Harness {
        let log = Arc::new(parking_lot::Mutex::new(MaterialLog::default()));
        let released = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));
        let session = VideoTextureSession::new(
            Box::new(ScriptedDecoder::new(script, released.clone())),
            Box::new(RecordingMaterial(log.clone())),
            looping,
        );
        let counter = ends.clone();
        session.on_end_of_stream(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        Harness {
            session,
            log,
            released,
            ends,
        }
    }

    fn tick(session: &VideoTextureSession, count: usize) {
        for i in 0..count {
            session.advance(Duration::from_millis(i as u64 * 16));
        }
    }

    #[test]
    fn play_and_pause_toggle_state() {
        let h = harness(vec![Step::Frame(1)], false);
        assert!(!h.session.is_playing());

        h.session.pause();
        assert_eq!(h.session.state(), PlaybackState::Stopped);

        h.session.play().unwrap();
        h.session.play().unwrap();
        assert!(h.session.is_playing());

        h.session.pause();
        assert_eq!(h.session.state(), PlaybackState::Paused);
        tick(&h.session, 3);
        assert!(h.log.lock().shown.is_empty());
    }

    #[test]
    fn pending_frames_keep_the_previous_image() {
        let h = harness(vec![Step::Frame(1), Step::Pending, Step::Frame(2)], false);
        h.session.play().unwrap();
        tick(&h.session, 3);

        assert_eq!(h.log.lock().shown, vec![1, 2]);
        assert_eq!(h.log.lock().cleared, 0);
    }

    #[test]
    fn end_of_stream_stops_and_notifies_once() {
        let h = harness(vec![Step::Frame(1)], false);
        h.session.play().unwrap();
        tick(&h.session, 5);

        assert_eq!(h.session.state(), PlaybackState::Stopped);
        assert_eq!(h.ends.load(Ordering::SeqCst), 1);

        h.session.play().unwrap();
        tick(&h.session, 2);
        assert_eq!(h.ends.load(Ordering::SeqCst), 2);
        assert_eq!(h.log.lock().shown, vec![1, 1]);
    }

    #[test]
    fn looping_restarts_without_notifying() {
        let h = harness(vec![Step::Frame(1), Step::Frame(2)], true);
        h.session.play().unwrap();
        tick(&h.session, 9);

        assert!(h.session.is_playing());
        assert_eq!(h.session.loops_completed(), 3);
        assert_eq!(h.ends.load(Ordering::SeqCst), 0);
        assert_eq!(h.log.lock().shown, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn disposed_session_ignores_everything() {
        let h = harness(vec![Step::Frame(1), Step::Frame(2)], false);
        h.session.play().unwrap();
        tick(&h.session, 1);

        h.session.dispose();
        h.session.dispose();
        h.session.play().unwrap();
        h.session.pause();
        tick(&h.session, 3);

        assert_eq!(h.session.state(), PlaybackState::Disposed);
        assert!(!h.session.is_playing());
        assert_eq!(h.released.load(Ordering::SeqCst), 1);
        assert_eq!(h.log.lock().cleared, 1);
        assert_eq!(h.log.lock().shown, vec![1]);
    }

    #[test]
    fn end_callback_may_restart_playback() {
        let log = Arc::new(parking_lot::Mutex::new(MaterialLog::default()));
        let session = Arc::new(VideoTextureSession::new(
            Box::new(ScriptedDecoder::new(
                vec![Step::Frame(7)],
                Arc::new(AtomicUsize::new(0)),
            )),
            Box::new(RecordingMaterial(log.clone())),
            false,
        ));
        let weak = Arc::downgrade(&session);
        session.on_end_of_stream(Box::new(move || {
            if let Some(session) = weak.upgrade() {
                session.play().unwrap();
            }
        }));

        session.play().unwrap();
        tick(&session, 2);
        assert!(session.is_playing());
    }
}
