use std::time::{Duration, Instant};

/// Monotonic clock shared by every stream of one recording.
#[derive(Debug, Clone, Copy)]
pub struct RecordingClock {
    origin: Instant,
}

impl RecordingClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Timestamp of a buffer of length `span` that was delivered just now.
    pub fn stamp_ending_now(&self, span: Duration) -> Duration {
        self.elapsed().saturating_sub(span)
    }
}

const NANOS_PER_SECOND: u128 = 1_000_000_000;
/// Ticks landing this close before a slot boundary count as on it, so a
/// 60 Hz source rounded to whole nanoseconds still hits every 30 Hz slot.
const SLOT_GRACE_NANOS: u128 = 1_000_000;

/// Frame slot of a reading taken `elapsed` into a recording at `fps`.
///
/// Slots are `1 / fps` wide and a reading belongs to the slot it falls in.
/// Both the sampler and the container writer place frames with this rule.
pub fn frame_slot(elapsed: Duration, fps: u32) -> u64 {
    let scaled = elapsed.as_nanos() * fps.max(1) as u128 + SLOT_GRACE_NANOS;
    (scaled / NANOS_PER_SECOND).min(u64::MAX as u128) as u64
}

/// Decides which ticks become captured frames for a target frame rate.
///
/// Time is divided into slots of `1 / fps`; at most one tick per slot is
/// sampled, so a faster tick source is downsampled and a slower one is never
/// padded.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    fps: u32,
    last_slot: Option<u64>,
    sampled: u64,
    skipped: u64,
}

impl FrameSampler {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            last_slot: None,
            sampled: 0,
            skipped: 0,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Width of one frame slot.
    pub fn interval(&self) -> Duration {
        Duration::from_nanos((NANOS_PER_SECOND / self.fps as u128) as u64)
    }

    pub fn slot_for(&self, elapsed: Duration) -> u64 {
        frame_slot(elapsed, self.fps)
    }

    /// Returns true when a tick at `elapsed` should produce a frame.
    pub fn should_sample(&mut self, elapsed: Duration) -> bool {
        let slot = self.slot_for(elapsed);
        match self.last_slot {
            Some(last) if slot <= last => {
                self.skipped += 1;
                false
            }
            _ => {
                self.last_slot = Some(slot);
                self.sampled += 1;
                true
            }
        }
    }

    pub fn sampled(&self) -> u64 {
        self.sampled
    }

    /// Ticks that fell in an already sampled slot.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
