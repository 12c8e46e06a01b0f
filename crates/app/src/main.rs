mod sim;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use ar_stage_core::{
    anchor::SurfaceId, AnchorBinding, AnchorPose, AppConfig, ArStageError, AudioInput, FrameSize,
    FixedPermission, GestureKind, GestureSample, HitTestResult, LocalAnchors, NodeId,
    PermissionStatus, RecordingEvent, RecordingRequest, RenderLoop, Recorder, ResizePolicy,
    SampleOutcome, SceneStore, ToneInput, TransformArbiter, VideoTextureSession,
};
use clap::{Parser, Subcommand};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use sim::{ColourMaterial, RampDecoder, TextureSlot, TopDownRasterizer};

const RENDER_HZ: u64 = 60;
const OBJECT_NODE: NodeId = NodeId(1);

fn main() -> ar_stage_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::live_defaults(),
    };

    match cli.command {
        Commands::Record(args) => run_record(&config, &args),
        Commands::Gestures { script } => run_gestures(&config, &script),
    }
}

/// The tracked scene shared by both subcommands.
struct Stage {
    scene: Arc<SceneStore>,
    arbiter: Arc<TransformArbiter>,
    binding: AnchorBinding,
}

impl Stage {
    fn new(config: &AppConfig) -> Self {
        let scene = Arc::new(SceneStore::new());
        let arbiter = Arc::new(TransformArbiter::new(scene.clone(), config.transform.clone()));
        let binding = AnchorBinding::new(arbiter.clone(), scene.clone(), Arc::new(LocalAnchors::new()));
        Self {
            scene,
            arbiter,
            binding,
        }
    }

    /// Simulates a tap that hit a surface just in front of the camera.
    fn place_object(&self) -> ar_stage_core::Result<Arc<ar_stage_core::ManipulableObject>> {
        let hit = HitTestResult {
            world_transform: Mat4::from_translation(Vec3::new(0.0, 0.0, 0.2)),
            surface: SurfaceId(1),
        };
        self.binding.bind(&hit, OBJECT_NODE)
    }
}

fn run_record(config: &AppConfig, args: &RecordArgs) -> ar_stage_core::Result<()> {
    let resize = args.resize()?;
    tracing::info!(output = ?args.output, seconds = args.seconds, ?resize, "starting simulated session");

    let stage = Stage::new(config);
    let object = stage.place_object()?;

    let texture: TextureSlot = Arc::new(Mutex::new(None));
    let video = Arc::new(VideoTextureSession::new(
        Box::new(RampDecoder::new(24, 48)),
        Box::new(ColourMaterial(texture.clone())),
        true,
    ));
    video.play()?;

    let source = TopDownRasterizer::new(
        stage.scene.clone(),
        OBJECT_NODE,
        texture,
        FrameSize::new(args.canvas_width, args.canvas_height),
    );
    let permissions = if args.deny_microphone {
        FixedPermission::denied()
    } else {
        FixedPermission::new(PermissionStatus::Undetermined, true)
    };
    let microphone: Arc<dyn AudioInput> = Arc::new(ToneInput::new(&config.audio, 440.0));
    let recorder = Recorder::builder(Arc::new(source))
        .config(config.recording.clone())
        .audio_input(microphone)
        .permissions(Arc::new(permissions))
        .build()?;
    let events = recorder.subscribe();

    let render = RenderLoop::new();
    render.register(video.clone());
    render.register(Arc::new(recorder.clone()));

    let mut request = RecordingRequest::new(&args.output)
        .with_audio(!args.no_audio)
        .with_resize(resize);
    if let Some(fps) = args.fps {
        request = request.with_fps(fps);
    }
    match recorder.start_record(request.clone()) {
        Ok(outcome) => tracing::info!(?outcome, "recording requested"),
        Err(ArStageError::PermissionDenied) => {
            tracing::warn!("microphone denied, recording video only");
            recorder.start_record(request.with_audio(false))?;
        }
        Err(err) => return Err(err),
    }

    let ticks = (args.seconds * RENDER_HZ as f32).round().max(1.0) as u64;
    let origin = Instant::now();
    for tick in 0..ticks {
        let host_time = Duration::from_nanos(tick * 1_000_000_000 / RENDER_HZ);
        drive_gestures(&stage, tick, ticks);
        if tick % 30 == 0 {
            let drift = AnchorPose {
                translation: Vec3::new(0.0, 0.0, 0.2 + tick as f32 * 1e-4),
                ..AnchorPose::default()
            };
            stage.binding.on_anchor_updated(object.anchor(), drift);
        }
        render.tick(host_time);

        if let Some(wait) = host_time.checked_sub(origin.elapsed()) {
            thread::sleep(wait);
        }
    }

    recorder.stop_record()?;
    let wait = config.recording.finalize_timeout() + Duration::from_secs(1);
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(RecordingEvent::Stopped { summary }) => {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                break;
            }
            Ok(RecordingEvent::Failed { path, reason }) => {
                recorder.dispose();
                video.dispose();
                return Err(ArStageError::msg(format!(
                    "recording to {} failed: {reason}",
                    path.display()
                )));
            }
            Ok(event) => tracing::debug!(?event, "recording event"),
            Err(_) => {
                tracing::warn!(?wait, "timed out waiting for the recording to finalize");
                break;
            }
        }
    }

    recorder.dispose();
    video.dispose();
    tracing::info!(
        video_frames = video.frames_presented(),
        loops = video.loops_completed(),
        render_ticks = render.ticks(),
        "session finished"
    );
    println!("{}", serde_json::to_string_pretty(&object.transform())?);
    Ok(())
}

/// Scripted touch input: a pinch, then a two-finger rotation, then a drag.
fn drive_gestures(stage: &Stage, tick: u64, ticks: u64) {
    let phase = tick * 3 / ticks;
    let result = match phase {
        0 => {
            if stage.arbiter.active_gesture() != Some(GestureKind::Pinch) {
                let _ = stage.arbiter.begin_gesture(GestureKind::Pinch);
            }
            stage.arbiter.apply_pinch(1.004)
        }
        1 => {
            if stage.arbiter.active_gesture() != Some(GestureKind::Rotate) {
                stage.arbiter.end_gesture();
                let _ = stage.arbiter.begin_gesture(GestureKind::Rotate);
                let _ = stage.arbiter.start_rotation();
            }
            stage.arbiter.apply_rotation(0.01)
        }
        _ => {
            if stage.arbiter.active_gesture() != Some(GestureKind::Pan) {
                stage.arbiter.end_gesture();
                let _ = stage.arbiter.begin_gesture(GestureKind::Pan);
            }
            stage.arbiter.apply_pan(Vec3::new(0.002, 0.0, 0.0))
        }
    };
    if let Err(err) = result {
        tracing::warn!(tick, %err, "gesture rejected");
    }
}

fn run_gestures(config: &AppConfig, script: &Path) -> ar_stage_core::Result<()> {
    let raw = std::fs::read_to_string(script)?;
    let samples: Vec<GestureSample> = serde_json::from_str(&raw)?;
    tracing::info!(?script, samples = samples.len(), "replaying gesture script");

    let stage = Stage::new(config);
    let object = stage.place_object()?;
    let (mut applied, mut stale, mut rejected) = (0usize, 0usize, 0usize);
    for sample in &samples {
        match stage.arbiter.apply(sample) {
            Ok(SampleOutcome::Applied) => applied += 1,
            Ok(SampleOutcome::Stale) => stale += 1,
            Err(err) => {
                rejected += 1;
                tracing::warn!(timestamp_ms = sample.timestamp_ms, %err, "gesture rejected");
            }
        }
    }
    tracing::info!(applied, stale, rejected, "script finished");
    println!("{}", serde_json::to_string_pretty(&object.transform())?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "AR scene manipulation and recording host", long_about = None)]
struct Cli {
    /// JSON configuration file; built-in defaults are used when absent.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulated AR session and record it to an AVI file.
    Record(RecordArgs),
    /// Replay a JSON gesture script against a freshly placed object.
    Gestures {
        /// File holding an array of gesture samples.
        script: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// Output file.
    #[arg(short, long, default_value = "ar-stage.avi")]
    output: PathBuf,
    /// Session length in seconds.
    #[arg(short, long, default_value_t = 3.0)]
    seconds: f32,
    /// Recording frame rate; the configured default when absent.
    #[arg(long)]
    fps: Option<u32>,
    /// Record video only.
    #[arg(long)]
    no_audio: bool,
    /// Simulate the user refusing microphone access.
    #[arg(long)]
    deny_microphone: bool,
    /// Rendered canvas width.
    #[arg(long, default_value_t = 320)]
    canvas_width: u32,
    /// Rendered canvas height.
    #[arg(long, default_value_t = 240)]
    canvas_height: u32,
    /// Output width; requires --height.
    #[arg(long, requires = "height")]
    width: Option<u32>,
    /// Output height; requires --width.
    #[arg(long, requires = "width")]
    height: Option<u32>,
    /// Center-crop to the output size instead of scaling.
    #[arg(long)]
    crop: bool,
}

impl RecordArgs {
    fn resize(&self) -> ar_stage_core::Result<ResizePolicy> {
        let policy = match (self.width, self.height) {
            (Some(width), Some(height)) => {
                let size = FrameSize::new(width, height);
                if self.crop {
                    ResizePolicy::Crop { size }
                } else {
                    ResizePolicy::Scale { size }
                }
            }
            (None, None) => ResizePolicy::Original,
            _ => return Err(ArStageError::invalid("--width and --height go together")),
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_flags_build_a_resize_policy() {
        let cli = Cli::parse_from([
            "ar-stage", "record", "--width", "64", "--height", "48", "--crop",
        ]);
        let Commands::Record(args) = cli.command else {
            panic!("expected the record subcommand");
        };
        assert_eq!(
            args.resize().unwrap(),
            ResizePolicy::Crop {
                size: FrameSize::new(64, 48)
            }
        );
    }

    #[test]
    fn gestures_accepts_a_global_config() {
        let cli = Cli::parse_from(["ar-stage", "gestures", "script.json", "--config", "stage.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("stage.json")));
        assert!(matches!(cli.command, Commands::Gestures { .. }));
    }

    #[test]
    fn scripted_session_moves_the_object() {
        let stage = Stage::new(&AppConfig::default());
        let object = stage.place_object().unwrap();
        for tick in 0..90 {
            drive_gestures(&stage, tick, 90);
        }
        let transform = object.transform();
        assert!(transform.scale.x > 1.0);
        assert!(transform.translation.x > 0.0);
        assert_eq!(stage.scene.transform(OBJECT_NODE), Some(transform));
    }
}
