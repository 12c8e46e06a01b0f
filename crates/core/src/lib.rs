//! Core library for AR Stage.
//!
//! Two subsystems live here. The gesture side arbitrates pinch, rotate and
//! pan input into one transform on the selected anchored object
//! ([`TransformArbiter`], [`AnchorBinding`]). The capture side samples
//! rendered frames and microphone audio against one clock and muxes them into
//! a media file ([`Recorder`]), alongside looping video textures
//! ([`VideoTextureSession`]). Tracking, rendering and platform prompts are
//! reached through traits so hosts can plug in their own engines.

pub mod anchor;
pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod gesture;
pub mod mux;
pub mod permission;
pub mod record;
pub mod render;
pub mod scene;
pub mod timeline;
pub mod video;

pub use anchor::{AnchorBinding, AnchorId, AnchorPose, AnchorTracker, HitTestResult, LocalAnchors};
pub use audio::{AudioBuffer, AudioFormat, AudioInput, AudioTap, ToneInput};
pub use capture::{FrameSize, FrameSource, ResizePolicy, VideoFrame};
pub use config::{AppConfig, AudioConfig, RecordingConfig, SamplingMode, TransformConfig};
pub use error::{ArStageError, Result};
pub use gesture::{
    Gesture, GestureKind, GestureSample, GestureTarget, ManipulableObject, SampleOutcome,
    TransformArbiter,
};
pub use mux::{AviFactory, ContainerFactory, MediaWriter, MuxSummary};
pub use permission::{FixedPermission, PermissionProvider, PermissionStatus};
pub use record::{Recorder, RecordingEvent, RecordingRequest, RecordingState, StartOutcome, ToggleOutcome};
pub use render::{FrameListener, RenderLoop};
pub use scene::{NodeId, SceneGraph, SceneStore, Transform};
pub use timeline::{FrameSampler, RecordingClock};
pub use video::{DecodePoll, PlaybackState, SurfaceMaterial, VideoDecoder, VideoTextureSession};
