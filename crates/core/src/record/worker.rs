//! Background threads owned by a recording session.

use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{bounded, select, tick, Receiver, Sender, TrySendError};

use crate::{
    capture::{ResizePolicy, TimedAudio, TimedFrame},
    mux::{Interleaver, MediaWriter, MuxItem, MuxSummary},
    Result,
};

/// Work for the mux thread, in delivery order.
pub(crate) enum MuxCommand {
    Video(TimedFrame),
    Audio(TimedAudio),
    /// Flush everything buffered and finalize the container.
    Finish,
    /// Discard the container.
    Abort,
}

/// Non-blocking enqueue used by producers. A full queue drops the sample.
pub(crate) fn enqueue(queue: &Sender<MuxCommand>, dropped: &AtomicU64, command: MuxCommand) {
    match queue.try_send(command) {
        Ok(()) => {}
        Err(TrySendError::Full(command)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let kind = match command {
                MuxCommand::Video(_) => "video",
                MuxCommand::Audio(_) => "audio",
                MuxCommand::Finish | MuxCommand::Abort => "control",
            };
            if total.is_power_of_two() {
                tracing::warn!(kind, dropped = total, "mux queue full, dropping sample");
            } else {
                tracing::debug!(kind, dropped = total, "mux queue full, dropping sample");
            }
        }
        Err(TrySendError::Disconnected(_)) => {
            tracing::trace!("mux worker has exited, sample discarded");
        }
    }
}

/// Sole owner of the container writer for one session.
pub(crate) struct MuxWorker {
    path: PathBuf,
    writer: Box<dyn MediaWriter>,
    interleaver: Interleaver,
    resize: ResizePolicy,
}

pub(crate) type MuxHandle = JoinHandle<Result<Option<MuxSummary>>>;

impl MuxWorker {
    pub(crate) fn new(
        path: PathBuf,
        writer: Box<dyn MediaWriter>,
        interleaver: Interleaver,
        resize: ResizePolicy,
    ) -> Self {
        Self {
            path,
            writer,
            interleaver,
            resize,
        }
    }

    /// Starts the mux thread. If the thread cannot be created the writer is
    /// dropped and the caller is responsible for removing the output file.
    pub(crate) fn spawn(self, commands: Receiver<MuxCommand>) -> Result<MuxHandle> {
        let handle = thread::Builder::new()
            .name("ar-stage-mux".into())
            .spawn(move || self.run(commands))?;
        Ok(handle)
    }

    /// Returns `Ok(None)` when the session was aborted.
    fn run(mut self, commands: Receiver<MuxCommand>) -> Result<Option<MuxSummary>> {
        loop {
            let command = commands.recv().unwrap_or_else(|_| {
                tracing::debug!("all producers gone, finalizing");
                MuxCommand::Finish
            });
            match command {
                MuxCommand::Video(mut timed) => {
                    timed.frame = self.resize.apply(timed.frame);
                    self.interleaver.push_video(timed);
                }
                MuxCommand::Audio(timed) => self.interleaver.push_audio(timed),
                MuxCommand::Finish => return self.finish().map(Some),
                MuxCommand::Abort => {
                    tracing::debug!(path = %self.path.display(), "aborting container");
                    self.writer.abort();
                    return Ok(None);
                }
            }

            while let Some(item) = self.interleaver.pop_ready() {
                if let Err(err) = write_item(self.writer.as_mut(), item) {
                    tracing::error!(path = %self.path.display(), %err, "container write failed");
                    self.writer.abort();
                    return Err(err);
                }
            }
        }
    }

    fn finish(mut self) -> Result<MuxSummary> {
        for item in self.interleaver.flush() {
            if let Err(err) = write_item(self.writer.as_mut(), item) {
                self.writer.abort();
                return Err(err);
            }
        }
        if self.interleaver.clamped() > 0 {
            tracing::debug!(clamped = self.interleaver.clamped(), "raised out-of-order timestamps");
        }
        let path = self.path;
        match self.writer.finalize() {
            Ok(summary) => Ok(summary),
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "finalize failed, removing output");
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }
}

fn write_item(writer: &mut dyn MediaWriter, item: MuxItem) -> Result<()> {
    match item {
        MuxItem::Video(timed) => writer.write_video(timed.timestamp, &timed.frame),
        MuxItem::Audio(timed) => writer.write_audio(timed.timestamp, &timed.buffer),
    }
}

/// Thread calling `on_tick` once at start and then every `interval`, until
/// stopped or until `on_tick` returns false.
pub(crate) struct FrameTimer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FrameTimer {
    pub(crate) fn spawn<F>(interval: Duration, on_tick: F) -> Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("ar-stage-frame-timer".into())
            .spawn(move || {
                // The first slot is sampled at start; `tick` first fires one interval later.
                if !on_tick() {
                    return;
                }
                let ticker = tick(interval);
                loop {
                    let running = select! {
                        recv(ticker) -> _ => true,
                        recv(stopped) -> _ => false,
                    };
                    if !running || !on_tick() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stops the timer and waits for an in-flight tick to finish.
    pub(crate) fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("frame timer thread panicked");
            }
        }
    }
}

impl Drop for FrameTimer {
    fn drop(&mut self) {
        // Only signal here; the last recorder handle may be dropped on the
        // timer thread itself.
        drop(self.stop.take());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        audio::{AudioBuffer, AudioFormat},
        capture::{FrameSize, VideoFrame},
    };

    #[derive(Default)]
    struct Log {
        video: Vec<(Duration, FrameSize)>,
        audio: Vec<Duration>,
        finalized: bool,
        aborted: bool,
    }

    struct LogWriter(Arc<Mutex<Log>>);

    impl MediaWriter for LogWriter {
        fn write_video(&mut self, timestamp: Duration, frame: &VideoFrame) -> Result<()> {
            self.0.lock().video.push((timestamp, frame.size()));
            Ok(())
        }

        fn write_audio(&mut self, timestamp: Duration, _buffer: &AudioBuffer) -> Result<()> {
            self.0.lock().audio.push(timestamp);
            Ok(())
        }

        fn finalize(self: Box<Self>) -> Result<MuxSummary> {
            let mut log = self.0.lock();
            log.finalized = true;
            Ok(MuxSummary {
                path: PathBuf::from("log"),
                video_frames: log.video.len() as u64,
                repeated_frames: 0,
                skipped_frames: 0,
                audio_chunks: log.audio.len() as u64,
                audio_bytes: 0,
                duration: Duration::ZERO,
            })
        }

        fn abort(self: Box<Self>) {
            self.0.lock().aborted = true;
        }
    }

    fn worker(log: &Arc<Mutex<Log>>, resize: ResizePolicy) -> MuxWorker {
        MuxWorker::new(
            PathBuf::from("log"),
            Box::new(LogWriter(log.clone())),
            Interleaver::new(true, 4),
            resize,
        )
    }

    fn video(ms: u64) -> MuxCommand {
        MuxCommand::Video(TimedFrame {
            timestamp: Duration::from_millis(ms),
            frame: VideoFrame::filled(FrameSize::new(8, 8), [0; 4]),
        })
    }

    fn audio(ms: u64) -> MuxCommand {
        MuxCommand::Audio(TimedAudio {
            timestamp: Duration::from_millis(ms),
            buffer: AudioBuffer::silence(AudioFormat::new(1_000, 1), 10),
        })
    }

    #[test]
    fn worker_resizes_interleaves_and_finalizes() {
        let log = Arc::new(Mutex::new(Log::default()));
        let resize = ResizePolicy::Scale {
            size: FrameSize::new(4, 2),
        };
        let (tx, rx) = bounded(16);
        let handle = worker(&log, resize).spawn(rx).unwrap();

        for command in [video(0), video(33), audio(10), audio(40), MuxCommand::Finish] {
            tx.send(command).unwrap();
        }
        let summary = handle.join().unwrap().unwrap().unwrap();
        assert_eq!(summary.video_frames, 2);
        assert_eq!(summary.audio_chunks, 2);

        let log = log.lock();
        assert!(log.finalized);
        assert!(log.video.iter().all(|(_, size)| *size == FrameSize::new(4, 2)));
        assert_eq!(log.audio, vec![Duration::from_millis(10), Duration::from_millis(40)]);
    }

    #[test]
    fn abort_discards_the_writer() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (tx, rx) = bounded(4);
        let handle = worker(&log, ResizePolicy::Original).spawn(rx).unwrap();
        tx.send(video(0)).unwrap();
        tx.send(MuxCommand::Abort).unwrap();

        assert!(handle.join().unwrap().unwrap().is_none());
        assert!(log.lock().aborted);
        assert!(!log.lock().finalized);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (tx, _rx) = bounded(1);
        let dropped = AtomicU64::new(0);
        enqueue(&tx, &dropped, video(0));
        enqueue(&tx, &dropped, video(33));
        enqueue(&tx, &dropped, audio(0));
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn timer_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut timer = FrameTimer::spawn(Duration::from_millis(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        timer.stop();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn timer_fires_once_on_start() {
        let (fired, on_fire) = bounded(1);
        let mut timer = FrameTimer::spawn(Duration::from_secs(3600), move || {
            let _ = fired.try_send(());
            true
        })
        .unwrap();
        assert!(on_fire.recv_timeout(Duration::from_secs(2)).is_ok());
        timer.stop();
    }
}
