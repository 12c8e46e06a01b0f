//! Timestamp-ordered merging of the video and audio streams.

use std::{collections::VecDeque, time::Duration};

use crate::capture::{TimedAudio, TimedFrame};

#[derive(Debug, Clone)]
pub enum MuxItem {
    Video(TimedFrame),
    Audio(TimedAudio),
}

impl MuxItem {
    pub fn timestamp(&self) -> Duration {
        match self {
            MuxItem::Video(frame) => frame.timestamp,
            MuxItem::Audio(audio) => audio.timestamp,
        }
    }
}

/// Buffers both streams and releases items in timestamp order.
///
/// An item is released once the other stream has something queued with an
/// equal or later timestamp, or once its own stream has built up more than
/// `max_lag` items (the other stream has stalled). Timestamps within a stream
/// are forced non-decreasing on entry.
#[derive(Debug)]
pub struct Interleaver {
    video: VecDeque<TimedFrame>,
    audio: VecDeque<TimedAudio>,
    expect_audio: bool,
    max_lag: usize,
    last_video: Duration,
    last_audio: Duration,
    clamped: u64,
}

impl Interleaver {
    /// `max_lag` is how many items one stream may queue while the other is silent.
    pub fn new(expect_audio: bool, max_lag: usize) -> Self {
        Self {
            video: VecDeque::new(),
            audio: VecDeque::new(),
            expect_audio,
            max_lag: max_lag.max(1),
            last_video: Duration::ZERO,
            last_audio: Duration::ZERO,
            clamped: 0,
        }
    }

    pub fn push_video(&mut self, mut frame: TimedFrame) {
        if frame.timestamp < self.last_video {
            frame.timestamp = self.last_video;
            self.clamped += 1;
        }
        self.last_video = frame.timestamp;
        self.video.push_back(frame);
    }

    pub fn push_audio(&mut self, mut audio: TimedAudio) {
        if audio.timestamp < self.last_audio {
            audio.timestamp = self.last_audio;
            self.clamped += 1;
        }
        self.last_audio = audio.timestamp;
        self.audio.push_back(audio);
    }

    /// Next item that can be written without breaking timestamp order.
    pub fn pop_ready(&mut self) -> Option<MuxItem> {
        let take_audio = match (self.video.front(), self.audio.front()) {
            (Some(video), Some(audio)) => audio.timestamp <= video.timestamp,
            (Some(_), None) if !self.expect_audio || self.video.len() > self.max_lag => false,
            (None, Some(_)) if self.audio.len() > self.max_lag => true,
            _ => return None,
        };
        self.take(take_audio)
    }

    /// Releases everything still buffered, in timestamp order.
    pub fn flush(&mut self) -> Vec<MuxItem> {
        let mut out = Vec::with_capacity(self.video.len() + self.audio.len());
        loop {
            let take_audio = match (self.video.front(), self.audio.front()) {
                (Some(video), Some(audio)) => audio.timestamp <= video.timestamp,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (None, None) => break,
            };
            if let Some(item) = self.take(take_audio) {
                out.push(item);
            }
        }
        out
    }

    fn take(&mut self, audio: bool) -> Option<MuxItem> {
        if audio {
            self.audio.pop_front().map(MuxItem::Audio)
        } else {
            self.video.pop_front().map(MuxItem::Video)
        }
    }

    /// Items buffered across both streams.
    pub fn pending(&self) -> usize {
        self.video.len() + self.audio.len()
    }

    /// Items whose timestamp had to be raised to keep their stream ordered.
    pub fn clamped(&self) -> u64 {
        self.clamped
    }
}
