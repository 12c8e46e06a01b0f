//! Recording state machine.
//!
//! A [`Recorder`] moves between [`RecordingState::Idle`],
//! [`RecordingState::Recording`] and [`RecordingState::Stopping`]. Each
//! session owns a mux thread fed through a bounded queue; frames come from
//! the render loop or a timer thread, audio from an [`AudioInput`] tap.
//! Finalization happens off the caller's thread and is reported through
//! [`Recorder::subscribe`].

mod worker;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    audio::{AudioBuffer, AudioInput, AudioSink, AudioTap},
    capture::{FrameSource, ResizePolicy, TimedAudio, TimedFrame},
    config::{RecordingConfig, SamplingMode},
    mux::{AviFactory, ContainerFactory, Interleaver, MuxSummary, TrackLayout},
    permission::{FixedPermission, PermissionProvider, PermissionStatus},
    render::FrameListener,
    timeline::{FrameSampler, RecordingClock},
    ArStageError, Result,
};

use worker::{enqueue, FrameTimer, MuxCommand, MuxHandle, MuxWorker};

/// Parameters of one recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub use_audio: bool,
    #[serde(default)]
    pub resize: ResizePolicy,
    /// Target frame rate; the configured default when absent.
    #[serde(default)]
    pub fps: Option<u32>,
}

impl RecordingRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            use_audio: false,
            resize: ResizePolicy::Original,
            fps: None,
        }
    }

    pub fn with_audio(mut self, use_audio: bool) -> Self {
        self.use_audio = use_audio;
        self
    }

    pub fn with_resize(mut self, resize: ResizePolicy) -> Self {
        self.resize = resize;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Checks the request and returns the frame rate to record at.
    pub fn validate(&self, config: &RecordingConfig) -> Result<u32> {
        if self.path.as_os_str().is_empty() {
            return Err(ArStageError::invalid("output path must not be empty"));
        }
        self.resize.validate()?;
        let fps = self.fps.unwrap_or(config.default_fps);
        if fps == 0 || fps > config.max_fps {
            return Err(ArStageError::invalid(format!(
                "fps must be between 1 and {}, got {fps}",
                config.max_fps
            )));
        }
        Ok(fps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Recording,
    /// Capture has stopped and the container is being finalized.
    Stopping,
}

/// Notifications delivered to [`Recorder::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordingEvent {
    Started { path: PathBuf },
    Stopped { summary: MuxSummary },
    /// A start needing the microphone was refused.
    PermissionDenied { path: PathBuf },
    /// An asynchronous start or a finalize did not succeed. No file remains.
    Failed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Microphone permission was requested; the result arrives as an event.
    AwaitingPermission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Start(StartOutcome),
    Stop,
}

struct ActiveSession {
    path: PathBuf,
    clock: RecordingClock,
    sampler: FrameSampler,
    stopped: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    queue: Sender<MuxCommand>,
    mux: MuxHandle,
    audio_tap: Option<Box<dyn AudioTap>>,
    timer: Option<FrameTimer>,
}

struct Core {
    state: RecordingState,
    session: Option<ActiveSession>,
    /// Token of a start waiting on the microphone prompt.
    pending_permission: Option<u64>,
    next_token: u64,
    /// Closed by the finalizer thread when it is done.
    finishing: Option<Receiver<()>>,
    disposed: bool,
}

struct Shared {
    core: Mutex<Core>,
    observers: Mutex<Vec<Sender<RecordingEvent>>>,
    source: Arc<dyn FrameSource>,
    audio: Option<Arc<dyn AudioInput>>,
    permissions: Arc<dyn PermissionProvider>,
    containers: Arc<dyn ContainerFactory>,
    config: RecordingConfig,
}

/// Records rendered frames and optional microphone audio to a media file.
///
/// Cloning yields another handle to the same recorder.
#[derive(Clone)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.state())
            .field("sampling", &self.shared.config.sampling)
            .finish()
    }
}

/// Configures a [`Recorder`]; see [`Recorder::builder`].
pub struct RecorderBuilder {
    source: Arc<dyn FrameSource>,
    audio: Option<Arc<dyn AudioInput>>,
    permissions: Arc<dyn PermissionProvider>,
    containers: Arc<dyn ContainerFactory>,
    config: RecordingConfig,
}

impl RecorderBuilder {
    pub fn config(mut self, config: RecordingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn audio_input(mut self, input: Arc<dyn AudioInput>) -> Self {
        self.audio = Some(input);
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionProvider>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn containers(mut self, containers: Arc<dyn ContainerFactory>) -> Self {
        self.containers = containers;
        self
    }

    pub fn build(self) -> Result<Recorder> {
        self.config.validate()?;
        Ok(Recorder {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: RecordingState::Idle,
                    session: None,
                    pending_permission: None,
                    next_token: 0,
                    finishing: None,
                    disposed: false,
                }),
                observers: Mutex::new(Vec::new()),
                source: self.source,
                audio: self.audio,
                permissions: self.permissions,
                containers: self.containers,
                config: self.config,
            }),
        })
    }
}

impl Recorder {
    /// Recorder writing AVI files with microphone access granted up front.
    pub fn builder(source: Arc<dyn FrameSource>) -> RecorderBuilder {
        RecorderBuilder {
            source,
            audio: None,
            permissions: Arc::new(FixedPermission::granted()),
            containers: Arc::new(AviFactory),
            config: RecordingConfig::default(),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared.core.lock().state
    }

    /// Whether a start is waiting on the microphone prompt.
    pub fn awaiting_permission(&self) -> bool {
        self.shared.core.lock().pending_permission.is_some()
    }

    /// Receiver for every event emitted from now on.
    pub fn subscribe(&self) -> Receiver<RecordingEvent> {
        let (tx, rx) = unbounded();
        self.shared.observers.lock().push(tx);
        rx
    }

    /// Starts a recording.
    ///
    /// When audio is requested and the microphone has not been authorized
    /// yet, the user is prompted and `AwaitingPermission` is returned; the
    /// session then starts (or is refused) when the answer arrives.
    pub fn start_record(&self, request: RecordingRequest) -> Result<StartOutcome> {
        let mut core = self.shared.core.lock();
        if core.disposed {
            return Err(ArStageError::unavailable("recorder has been disposed"));
        }
        if core.state != RecordingState::Idle || core.pending_permission.is_some() {
            return Err(ArStageError::AlreadyRecording);
        }
        let fps = request.validate(&self.shared.config)?;

        if request.use_audio {
            match self.shared.permissions.microphone_status() {
                PermissionStatus::Granted => {}
                PermissionStatus::Denied => {
                    drop(core);
                    tracing::warn!(path = %request.path.display(), "microphone access denied");
                    self.emit(RecordingEvent::PermissionDenied { path: request.path });
                    return Err(ArStageError::PermissionDenied);
                }
                PermissionStatus::Undetermined => {
                    core.next_token += 1;
                    let token = core.next_token;
                    core.pending_permission = Some(token);
                    drop(core);

                    tracing::info!(path = %request.path.display(), "requesting microphone access");
                    let shared = Arc::downgrade(&self.shared);
                    self.shared
                        .permissions
                        .request_microphone(Box::new(move |granted| {
                            if let Some(shared) = shared.upgrade() {
                                Recorder { shared }.resolve_permission(token, granted, request, fps);
                            }
                        }));
                    return Ok(StartOutcome::AwaitingPermission);
                }
            }
        }

        let path = request.path.clone();
        self.begin_session(&mut core, request, fps)?;
        drop(core);
        self.emit(RecordingEvent::Started { path });
        Ok(StartOutcome::Started)
    }

    fn resolve_permission(&self, token: u64, granted: bool, request: RecordingRequest, fps: u32) {
        let mut core = self.shared.core.lock();
        if core.pending_permission != Some(token) || core.disposed {
            tracing::debug!(token, "ignoring permission answer for a cancelled start");
            return;
        }
        core.pending_permission = None;
        let path = request.path.clone();

        if !granted {
            drop(core);
            tracing::warn!(path = %path.display(), "microphone access refused");
            self.emit(RecordingEvent::PermissionDenied { path });
            return;
        }

        let event = match self.begin_session(&mut core, request, fps) {
            Ok(()) => RecordingEvent::Started { path },
            Err(err) => RecordingEvent::Failed {
                path,
                reason: err.to_string(),
            },
        };
        drop(core);
        self.emit(event);
    }

    /// Opens the container and starts the producers. On error nothing is
    /// left running and no output file remains.
    fn begin_session(&self, core: &mut Core, request: RecordingRequest, fps: u32) -> Result<()> {
        let shared = &self.shared;
        let audio_input = match (request.use_audio, &shared.audio) {
            (false, _) => None,
            (true, Some(input)) => Some(input.clone()),
            (true, None) => {
                return Err(ArStageError::unavailable("no audio input is configured"));
            }
        };

        let layout = TrackLayout {
            fps,
            frame_size: request.resize.fixed_size(),
            audio: audio_input.as_ref().map(|input| input.format()),
        };
        let writer = shared.containers.create(&request.path, layout)?;

        let (queue, commands) = bounded(shared.config.queue_capacity);
        let interleaver = Interleaver::new(audio_input.is_some(), shared.config.max_interleave_lag);
        let mux = MuxWorker::new(request.path.clone(), writer, interleaver, request.resize)
            .spawn(commands)
            .map_err(|err| {
                let _ = std::fs::remove_file(&request.path);
                err
            })?;

        let clock = RecordingClock::start();
        let stopped = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));

        let abort = |mux: MuxHandle, stopped: &AtomicBool| {
            stopped.store(true, Ordering::Release);
            let _ = queue.send(MuxCommand::Abort);
            if mux.join().is_err() {
                tracing::warn!("mux worker panicked during abort");
            }
        };

        let audio_tap = match audio_input {
            Some(input) => {
                let sink = audio_sink(clock, stopped.clone(), dropped.clone(), queue.clone());
                match input.start(sink) {
                    Ok(tap) => Some(tap),
                    Err(err) => {
                        abort(mux, &stopped);
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let timer = match shared.config.sampling {
            SamplingMode::RenderLoop => None,
            SamplingMode::Timer => {
                let weak = Arc::downgrade(&self.shared);
                let interval = FrameSampler::new(fps).interval();
                match FrameTimer::spawn(interval, move || match weak.upgrade() {
                    Some(shared) => {
                        Recorder { shared }.capture_tick();
                        true
                    }
                    None => false,
                }) {
                    Ok(timer) => Some(timer),
                    Err(err) => {
                        if let Some(mut tap) = audio_tap {
                            tap.stop();
                        }
                        abort(mux, &stopped);
                        return Err(err);
                    }
                }
            }
        };

        tracing::info!(
            path = %request.path.display(),
            fps,
            audio = audio_tap.is_some(),
            resize = ?request.resize,
            sampling = ?shared.config.sampling,
            "recording started"
        );
        core.session = Some(ActiveSession {
            path: request.path,
            clock,
            sampler: FrameSampler::new(fps),
            stopped,
            dropped,
            queue,
            mux,
            audio_tap,
            timer,
        });
        core.state = RecordingState::Recording;
        Ok(())
    }

    /// Stops the active recording. Returns once capture has stopped;
    /// finalization continues in the background and ends with a
    /// [`RecordingEvent::Stopped`] or [`RecordingEvent::Failed`]. Also
    /// cancels a start waiting on the microphone prompt. A no-op when idle.
    pub fn stop_record(&self) -> Result<()> {
        let session = {
            let mut core = self.shared.core.lock();
            if core.pending_permission.take().is_some() {
                tracing::info!("cancelled start awaiting microphone access");
            }
            self.take_session(&mut core)
        };
        if let Some((session, done)) = session {
            self.finish(session, done);
        }
        Ok(())
    }

    /// Starts when idle, otherwise stops. The request is only used to start.
    pub fn toggle_record(&self, request: RecordingRequest) -> Result<ToggleOutcome> {
        let active = {
            let core = self.shared.core.lock();
            core.state != RecordingState::Idle || core.pending_permission.is_some()
        };
        if active {
            self.stop_record()?;
            Ok(ToggleOutcome::Stop)
        } else {
            self.start_record(request).map(ToggleOutcome::Start)
        }
    }

    /// Stops any recording, waits up to the configured finalize timeout for
    /// the file to be completed and refuses later starts. Idempotent.
    pub fn dispose(&self) {
        let (session, finishing) = {
            let mut core = self.shared.core.lock();
            if core.disposed {
                return;
            }
            core.disposed = true;
            core.pending_permission = None;
            let session = self.take_session(&mut core);
            (session, core.finishing.take())
        };

        if let Some((session, done)) = session {
            self.finish(session, done);
        }

        if let Some(done) = finishing {
            let timeout = self.shared.config.finalize_timeout();
            if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(timeout) {
                tracing::warn!(?timeout, "recording did not finalize before dispose timed out");
            }
        }
        tracing::debug!("recorder disposed");
    }

    /// Moves a running session to `Stopping`, handing back the session and
    /// the sender the finalizer closes when done.
    fn take_session(&self, core: &mut Core) -> Option<(ActiveSession, Sender<()>)> {
        if core.state != RecordingState::Recording {
            return None;
        }
        let session = core.session.take()?;
        let (done, waiter) = bounded(0);
        core.state = RecordingState::Stopping;
        core.finishing = Some(waiter);
        Some((session, done))
    }

    /// Stops producers outside the core lock and finalizes on a background
    /// thread.
    fn finish(&self, mut session: ActiveSession, done: Sender<()>) {
        session.stopped.store(true, Ordering::Release);
        if let Some(mut timer) = session.timer.take() {
            timer.stop();
        }
        if let Some(mut tap) = session.audio_tap.take() {
            tap.stop();
        }
        let dropped = session.dropped.load(Ordering::Relaxed);
        let _ = session.queue.send(MuxCommand::Finish);
        tracing::info!(
            path = %session.path.display(),
            frames = session.sampler.sampled(),
            skipped_ticks = session.sampler.skipped(),
            dropped,
            "recording stopping"
        );

        let recorder = self.clone();
        let path = session.path.clone();
        let spawned = thread::Builder::new()
            .name("ar-stage-finalize".into())
            .spawn(move || {
                let outcome = session.mux.join();
                recorder.finalized(session.path, outcome);
                drop(done);
            });
        if let Err(err) = spawned {
            tracing::error!(%err, "could not start finalizer thread");
            self.finalized(path, Ok(Err(ArStageError::Io(err))));
        }
    }

    fn finalized(&self, path: PathBuf, outcome: thread::Result<Result<Option<MuxSummary>>>) {
        self.shared.core.lock().state = RecordingState::Idle;
        let event = match outcome {
            Ok(Ok(Some(summary))) => RecordingEvent::Stopped { summary },
            Ok(Ok(None)) => RecordingEvent::Failed {
                path,
                reason: "recording was aborted".into(),
            },
            Ok(Err(err)) => {
                tracing::error!(path = %path.display(), %err, "recording failed");
                RecordingEvent::Failed {
                    path,
                    reason: err.to_string(),
                }
            }
            Err(_) => RecordingEvent::Failed {
                path,
                reason: "mux worker panicked".into(),
            },
        };
        self.emit(event);
    }

    /// Samples a frame at the current recording clock reading.
    pub fn capture_tick(&self) {
        self.sample_frame(None);
    }

    /// Samples a frame at an explicit clock reading, for hosts that drive
    /// the recording clock themselves.
    pub fn capture_tick_at(&self, elapsed: Duration) {
        self.sample_frame(Some(elapsed));
    }

    fn sample_frame(&self, elapsed: Option<Duration>) {
        let (timestamp, queue, stopped, dropped) = {
            let mut core = self.shared.core.lock();
            let Some(session) = core.session.as_mut() else {
                return;
            };
            let elapsed = elapsed.unwrap_or_else(|| session.clock.elapsed());
            if !session.sampler.should_sample(elapsed) {
                return;
            }
            (
                elapsed,
                session.queue.clone(),
                session.stopped.clone(),
                session.dropped.clone(),
            )
        };

        let Some(frame) = self.shared.source.rasterize() else {
            tracing::trace!(?timestamp, "frame source had nothing to capture");
            return;
        };
        if stopped.load(Ordering::Acquire) {
            return;
        }
        enqueue(&queue, &dropped, MuxCommand::Video(TimedFrame { timestamp, frame }));
    }

    fn emit(&self, event: RecordingEvent) {
        tracing::debug!(?event, "recording event");
        self.shared
            .observers
            .lock()
            .retain(|observer| observer.send(event.clone()).is_ok());
    }
}

impl FrameListener for Recorder {
    fn on_render_tick(&self, _host_time: Duration) {
        if self.shared.config.sampling == SamplingMode::RenderLoop {
            self.capture_tick();
        }
    }
}

fn audio_sink(
    clock: RecordingClock,
    stopped: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    queue: Sender<MuxCommand>,
) -> AudioSink {
    Arc::new(move |buffer: AudioBuffer| {
        if stopped.load(Ordering::Acquire) {
            return;
        }
        let timestamp = clock.stamp_ending_now(buffer.duration());
        tracing::trace!(?timestamp, level = buffer.rms(), frames = buffer.frames(), "audio buffer");
        enqueue(&queue, &dropped, MuxCommand::Audio(TimedAudio { timestamp, buffer }));
    })
}
