//! Gesture-to-transform arbitration.
//!
//! [`TransformArbiter`] owns the selection and turns 2-D gesture deltas into
//! transform updates on the selected [`ManipulableObject`]. The world
//! transform of an object is the tracked anchor pose composed with the
//! gesture-owned local state (offset, yaw, scale), so tracking updates and
//! gestures never overwrite each other.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use glam::{Quat, Vec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    anchor::{AnchorId, AnchorPose},
    scene::{NodeId, SceneGraph, Transform},
    ArStageError, Result, TransformConfig,
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Gesture families recognised by the host's interaction layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    Pinch,
    Rotate,
    Pan,
}

/// Who a recognised gesture is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureTarget {
    /// Direct manipulation of the selected object.
    Object,
    /// Camera or scene navigation on the hosting view.
    View,
}

/// Payload of a single gesture callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Gesture {
    /// Incremental scale factor since the previous pinch callback.
    Pinch { scale: f32 },
    /// Rotation in radians, clockwise-positive in screen space, relative to
    /// the most recent `StartRotate`.
    Rotate { angle: f32 },
    StartRotate,
    /// World-space translation delta.
    Pan { translation: Vec3 },
}

impl Gesture {
    pub fn kind(&self) -> GestureKind {
        match self {
            Gesture::Pinch { .. } => GestureKind::Pinch,
            Gesture::Rotate { .. } | Gesture::StartRotate => GestureKind::Rotate,
            Gesture::Pan { .. } => GestureKind::Pan,
        }
    }
}

/// What [`TransformArbiter::apply`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Applied,
    /// Older than the last applied sample; nothing changed.
    Stale,
}

/// Ephemeral gesture event, consumed once by [`TransformArbiter::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GestureSample {
    #[serde(flatten)]
    pub gesture: Gesture,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl GestureSample {
    pub fn new(gesture: Gesture, timestamp_ms: u64) -> Self {
        Self {
            gesture,
            timestamp_ms,
        }
    }
}

/// A scene node bound to a tracked anchor that the user can select and
/// transform.
#[derive(Debug)]
pub struct ManipulableObject {
    id: ObjectId,
    node: NodeId,
    state: Mutex<ObjectState>,
}

#[derive(Debug)]
struct ObjectState {
    anchor: AnchorId,
    anchor_pose: AnchorPose,
    offset: Vec3,
    yaw: f32,
    base_scale: Vec3,
    requested_scale: f32,
    applied_scale: f32,
    control_priority: bool,
}

impl ObjectState {
    fn world_transform(&self) -> Transform {
        let rotation = self.anchor_pose.rotation;
        Transform {
            translation: self.anchor_pose.translation + rotation * self.offset,
            rotation: rotation * Quat::from_rotation_y(self.yaw),
            scale: self.base_scale * self.applied_scale,
        }
    }
}

impl ManipulableObject {
    pub fn new(node: NodeId, anchor: AnchorId, pose: AnchorPose, base_scale: Vec3) -> Self {
        Self {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            node,
            state: Mutex::new(ObjectState {
                anchor,
                anchor_pose: pose,
                offset: Vec3::ZERO,
                yaw: 0.0,
                base_scale,
                requested_scale: 1.0,
                applied_scale: 1.0,
                control_priority: false,
            }),
        }
    }

    /// Process-unique identity, stable for the object's lifetime.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Scene node this object drives.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Anchor the object is attached to.
    pub fn anchor(&self) -> AnchorId {
        self.state.lock().anchor
    }

    /// Current world transform.
    pub fn transform(&self) -> Transform {
        self.state.lock().world_transform()
    }

    /// Uniform scale factor currently applied on top of the base scale.
    pub fn scale_factor(&self) -> f32 {
        self.state.lock().applied_scale
    }

    /// Whether a gesture on this object suppresses view navigation.
    pub fn has_control_priority(&self) -> bool {
        self.state.lock().control_priority
    }

    pub fn set_control_priority(&self, priority: bool) {
        self.state.lock().control_priority = priority;
    }

    /// Replaces the anchor pose and pushes the new world transform to
    /// `scene` under the object lock. Scale, yaw and offset are
    /// gesture-owned and survive.
    pub(crate) fn sync_anchor(&self, pose: AnchorPose, scene: &dyn SceneGraph) -> Transform {
        let mut state = self.state.lock();
        state.anchor_pose = pose;
        let transform = state.world_transform();
        scene.set_transform(self.node, &transform);
        transform
    }
}

#[derive(Debug, Clone, Copy)]
struct RotationReference {
    object: ObjectId,
    base_yaw: f32,
    accumulated: f32,
}

#[derive(Debug, Default)]
struct ArbiterState {
    selected: Weak<ManipulableObject>,
    rotation: Option<RotationReference>,
    active: Option<GestureKind>,
    last_sample_ms: Option<u64>,
}

impl ArbiterState {
    fn reset_gesture(&mut self) {
        self.rotation = None;
        self.active = None;
        self.last_sample_ms = None;
    }
}

/// Owns the single selection and applies gesture deltas to it.
///
/// Every apply call holds the arbiter lock across the object update, so a
/// gesture callback can never observe or produce a half-applied transform.
pub struct TransformArbiter {
    scene: Arc<dyn SceneGraph>,
    bounds: TransformConfig,
    inner: Mutex<ArbiterState>,
}

impl std::fmt::Debug for TransformArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformArbiter")
            .field("bounds", &self.bounds)
            .field("state", &*self.inner.lock())
            .finish()
    }
}

impl TransformArbiter {
    pub fn new(scene: Arc<dyn SceneGraph>, bounds: TransformConfig) -> Self {
        Self {
            scene,
            bounds,
            inner: Mutex::new(ArbiterState::default()),
        }
    }

    pub fn bounds(&self) -> &TransformConfig {
        &self.bounds
    }

    /// Makes `object` the selection. Any gesture in progress on the previous
    /// selection is abandoned.
    pub fn select(&self, object: &Arc<ManipulableObject>) {
        let mut state = self.inner.lock();
        let already = state
            .selected
            .upgrade()
            .map(|current| Arc::ptr_eq(&current, object))
            .unwrap_or(false);
        if already {
            return;
        }
        state.selected = Arc::downgrade(object);
        state.reset_gesture();
        tracing::debug!(object = object.id().0, "object selected");
    }

    /// Drops the selection and any gesture in progress.
    pub fn clear_selection(&self) {
        let mut state = self.inner.lock();
        if state.selected.strong_count() > 0 {
            tracing::debug!("selection cleared");
        }
        state.selected = Weak::new();
        state.reset_gesture();
    }

    pub fn selected(&self) -> Option<Arc<ManipulableObject>> {
        self.inner.lock().selected.upgrade()
    }

    pub fn is_selected(&self, object: &ManipulableObject) -> bool {
        self.selected()
            .map(|current| std::ptr::eq(Arc::as_ptr(&current), object))
            .unwrap_or(false)
    }

    /// Clears the selection if it currently points at `object`.
    pub(crate) fn clear_if_selected(&self, object: &ManipulableObject) -> bool {
        let mut state = self.inner.lock();
        let selected = state
            .selected
            .upgrade()
            .map(|current| std::ptr::eq(Arc::as_ptr(&current), object))
            .unwrap_or(false);
        if selected {
            state.selected = Weak::new();
            state.reset_gesture();
        }
        selected
    }

    /// Multiplies the selected object's scale by `scale_factor`, clamped to
    /// the configured bounds.
    pub fn apply_pinch(&self, scale_factor: f32) -> Result<()> {
        if !(scale_factor.is_finite() && scale_factor > 0.0) {
            return Err(ArStageError::invalid(format!(
                "pinch scale factor must be positive, got {scale_factor}"
            )));
        }
        let bounds = self.bounds.clone();
        self.with_selection(|_, _, object| {
            object.requested_scale *= scale_factor;
            object.applied_scale = object
                .requested_scale
                .clamp(bounds.min_scale, bounds.max_scale);
        })
    }

    /// Establishes the reference yaw for the rotation deltas that follow.
    pub fn start_rotation(&self) -> Result<()> {
        self.with_selection(|arbiter, id, object| {
            arbiter.rotation = Some(RotationReference {
                object: id,
                base_yaw: object.yaw,
                accumulated: 0.0,
            });
        })
    }

    /// Applies a yaw delta relative to the last [`start_rotation`] reference.
    ///
    /// [`start_rotation`]: Self::start_rotation
    pub fn apply_rotation(&self, angle_delta: f32) -> Result<()> {
        if !angle_delta.is_finite() {
            return Err(ArStageError::invalid("rotation delta must be finite"));
        }
        let mut state = self.inner.lock();
        let object = Self::selection(&mut state)?;
        let mut object_state = object.state.lock();

        let reference = match state.rotation {
            Some(reference) if reference.object == object.id => reference,
            _ => RotationReference {
                object: object.id,
                base_yaw: object_state.yaw,
                accumulated: 0.0,
            },
        };
        let accumulated = reference.accumulated + angle_delta;
        // Screen rotation is clockwise-positive; yaw about +Y is
        // counter-clockwise when seen from above.
        object_state.yaw = reference.base_yaw - accumulated;
        state.rotation = Some(RotationReference {
            accumulated,
            ..reference
        });

        let transform = object_state.world_transform();
        self.scene.set_transform(object.node, &transform);
        Ok(())
    }

    /// Moves the selected object by a world-space delta.
    pub fn apply_pan(&self, translation: Vec3) -> Result<()> {
        if !translation.is_finite() {
            return Err(ArStageError::invalid("pan translation must be finite"));
        }
        self.with_selection(|_, _, object| {
            let local = object.anchor_pose.rotation.inverse() * translation;
            object.offset += local;
        })
    }

    /// Dispatches a gesture sample. Samples older than the last applied one
    /// are dropped and reported as [`SampleOutcome::Stale`]; a rejected
    /// sample does not move the cutoff.
    pub fn apply(&self, sample: &GestureSample) -> Result<SampleOutcome> {
        {
            let state = self.inner.lock();
            if let Some(last) = state.last_sample_ms {
                if sample.timestamp_ms < last {
                    tracing::trace!(
                        timestamp_ms = sample.timestamp_ms,
                        last,
                        "dropping out-of-order gesture sample"
                    );
                    return Ok(SampleOutcome::Stale);
                }
            }
            if state.selected.strong_count() == 0 {
                return Err(ArStageError::NoSelection);
            }
        }

        match sample.gesture {
            Gesture::Pinch { scale } => self.apply_pinch(scale),
            Gesture::Rotate { angle } => self.apply_rotation(angle),
            Gesture::StartRotate => self.start_rotation(),
            Gesture::Pan { translation } => self.apply_pan(translation),
        }?;

        let mut state = self.inner.lock();
        let last = state
            .last_sample_ms
            .map_or(sample.timestamp_ms, |last| last.max(sample.timestamp_ms));
        state.last_sample_ms = Some(last);
        Ok(SampleOutcome::Applied)
    }

    /// Marks the start of an object-directed gesture.
    pub fn begin_gesture(&self, kind: GestureKind) -> Result<()> {
        let mut state = self.inner.lock();
        Self::selection(&mut state)?;
        state.active = Some(kind);
        Ok(())
    }

    /// Ends the active gesture; ending a rotation discards its reference yaw.
    pub fn end_gesture(&self) {
        let mut state = self.inner.lock();
        if state.active.take() == Some(GestureKind::Rotate) {
            state.rotation = None;
        }
    }

    pub fn active_gesture(&self) -> Option<GestureKind> {
        self.inner.lock().active
    }

    /// Whether a gesture aimed at `target` should be delivered right now.
    /// View gestures are suppressed while a priority-holding selection is
    /// being manipulated.
    pub fn allows(&self, target: GestureTarget) -> bool {
        let state = self.inner.lock();
        let selected = state.selected.upgrade();
        match target {
            GestureTarget::Object => selected.is_some(),
            GestureTarget::View => match (&selected, state.active) {
                (Some(object), Some(_)) => !object.has_control_priority(),
                _ => true,
            },
        }
    }

    /// Policy for two recognizers firing together. Pinch and rotate on the
    /// object always combine; anything involving a pan only combines when no
    /// selected object holds control priority.
    pub fn recognize_simultaneously(&self, a: GestureKind, b: GestureKind) -> bool {
        if a == b {
            return false;
        }
        let object_pair = matches!(
            (a, b),
            (GestureKind::Pinch, GestureKind::Rotate) | (GestureKind::Rotate, GestureKind::Pinch)
        );
        if object_pair {
            return true;
        }
        !self
            .selected()
            .map(|object| object.has_control_priority())
            .unwrap_or(false)
    }

    fn selection(state: &mut ArbiterState) -> Result<Arc<ManipulableObject>> {
        match state.selected.upgrade() {
            Some(object) => Ok(object),
            None => {
                state.reset_gesture();
                Err(ArStageError::NoSelection)
            }
        }
    }

    fn with_selection<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut ArbiterState, ObjectId, &mut ObjectState),
    {
        let mut state = self.inner.lock();
        let object = Self::selection(&mut state)?;
        let mut object_state = object.state.lock();
        update(&mut state, object.id, &mut object_state);
        let transform = object_state.world_transform();
        self.scene.set_transform(object.node, &transform);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneStore;

    fn setup() -> (Arc<SceneStore>, TransformArbiter) {
        let scene = Arc::new(SceneStore::new());
        let arbiter = TransformArbiter::new(scene.clone(), TransformConfig::default());
        (scene, arbiter)
    }

    fn object(node: u64) -> Arc<ManipulableObject> {
        Arc::new(ManipulableObject::new(
            NodeId(node),
            AnchorId(node),
            AnchorPose::default(),
            Vec3::ONE,
        ))
    }

    #[test]
    fn gestures_without_selection_fail() {
        let (_, arbiter) = setup();
        assert!(matches!(
            arbiter.apply_pinch(2.0),
            Err(ArStageError::NoSelection)
        ));
        assert!(matches!(
            arbiter.apply_rotation(0.3),
            Err(ArStageError::NoSelection)
        ));
        assert!(matches!(
            arbiter.start_rotation(),
            Err(ArStageError::NoSelection)
        ));
    }

    #[test]
    fn only_one_object_is_selected() {
        let (_, arbiter) = setup();
        let a = object(1);
        let b = object(2);

        arbiter.select(&a);
        arbiter.select(&b);
        assert!(arbiter.is_selected(&b));
        assert!(!arbiter.is_selected(&a));

        arbiter.clear_selection();
        arbiter.clear_selection();
        assert!(arbiter.selected().is_none());
    }

    #[test]
    fn pinch_mutates_only_the_current_selection() {
        let (scene, arbiter) = setup();
        let a = object(1);
        let b = object(2);

        arbiter.select(&a);
        arbiter.apply_pinch(2.0).unwrap();
        arbiter.select(&b);
        arbiter.apply_pinch(3.0).unwrap();

        assert_eq!(a.scale_factor(), 2.0);
        assert_eq!(b.scale_factor(), 3.0);
        assert_eq!(scene.transform(NodeId(2)).unwrap().scale, Vec3::splat(3.0));
    }

    #[test]
    fn pinch_composes_and_clamps_identically() {
        let (_, arbiter) = setup();

        for (s1, s2, expected) in [
            (2.0_f32, 1.5_f32, 3.0_f32),
            (16.0, 2.0, 10.0),
            (16.0, 0.5, 8.0),
            (0.25, 0.125, 0.1),
        ] {
            let stepwise = object(1);
            let single = object(2);

            arbiter.select(&stepwise);
            arbiter.apply_pinch(s1).unwrap();
            arbiter.apply_pinch(s2).unwrap();
            arbiter.select(&single);
            arbiter.apply_pinch(s1 * s2).unwrap();

            assert!((stepwise.scale_factor() - single.scale_factor()).abs() < 1e-5);
            assert!((stepwise.scale_factor() - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn degenerate_pinch_is_rejected() {
        let (_, arbiter) = setup();
        let a = object(1);
        arbiter.select(&a);

        assert!(matches!(
            arbiter.apply_pinch(0.0),
            Err(ArStageError::InvalidInput(_))
        ));
        assert!(arbiter.apply_pinch(-1.0).is_err());
        assert!(arbiter.apply_pinch(f32::NAN).is_err());
        assert_eq!(a.scale_factor(), 1.0);
    }

    #[test]
    fn split_rotation_matches_single_delta() {
        let (_, arbiter) = setup();
        let split = object(1);
        let whole = object(2);

        arbiter.select(&split);
        arbiter.start_rotation().unwrap();
        arbiter.apply_rotation(0.3).unwrap();
        arbiter.apply_rotation(0.4).unwrap();

        arbiter.select(&whole);
        arbiter.start_rotation().unwrap();
        arbiter.apply_rotation(0.3 + 0.4).unwrap();

        assert!(split
            .transform()
            .rotation
            .abs_diff_eq(whole.transform().rotation, 1e-6));
    }

    #[test]
    fn restarting_rotation_keeps_previous_yaw() {
        let (_, arbiter) = setup();
        let a = object(1);
        arbiter.select(&a);

        arbiter.start_rotation().unwrap();
        arbiter.apply_rotation(0.5).unwrap();
        arbiter.start_rotation().unwrap();
        arbiter.apply_rotation(0.25).unwrap();

        let expected = Quat::from_rotation_y(-0.75);
        assert!(a.transform().rotation.abs_diff_eq(expected, 1e-6));
    }

    #[test]
    fn selecting_another_object_drops_rotation_in_progress() {
        let (_, arbiter) = setup();
        let a = object(1);
        let b = object(2);

        arbiter.select(&a);
        arbiter.start_rotation().unwrap();
        arbiter.apply_rotation(0.5).unwrap();
        arbiter.select(&b);
        arbiter.apply_rotation(0.1).unwrap();

        let expected = Quat::from_rotation_y(-0.1);
        assert!(b.transform().rotation.abs_diff_eq(expected, 1e-6));
        assert!(a
            .transform()
            .rotation
            .abs_diff_eq(Quat::from_rotation_y(-0.5), 1e-6));
    }

    #[test]
    fn dropped_selection_reports_no_selection() {
        let (_, arbiter) = setup();
        let a = object(1);
        arbiter.select(&a);
        drop(a);

        assert!(matches!(
            arbiter.apply_pinch(1.5),
            Err(ArStageError::NoSelection)
        ));
    }

    #[test]
    fn pan_moves_relative_to_anchor() {
        let (_, arbiter) = setup();
        let a = Arc::new(ManipulableObject::new(
            NodeId(1),
            AnchorId(1),
            AnchorPose {
                translation: Vec3::new(0.0, 0.0, -1.0),
                rotation: Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            },
            Vec3::ONE,
        ));
        arbiter.select(&a);
        arbiter.apply_pan(Vec3::new(0.5, 0.0, 0.0)).unwrap();

        let translation = a.transform().translation;
        assert!(translation.abs_diff_eq(Vec3::new(0.5, 0.0, -1.0), 1e-5));
    }

    #[test]
    fn samples_dispatch_and_skip_stale_ones() {
        let (_, arbiter) = setup();
        let a = object(1);
        arbiter.select(&a);

        let applied = arbiter
            .apply(&GestureSample::new(Gesture::Pinch { scale: 2.0 }, 10))
            .unwrap();
        let stale = arbiter
            .apply(&GestureSample::new(Gesture::Pinch { scale: 4.0 }, 5))
            .unwrap();

        assert_eq!(applied, SampleOutcome::Applied);
        assert_eq!(stale, SampleOutcome::Stale);
        assert_eq!(a.scale_factor(), 2.0);
    }

    #[test]
    fn rejected_samples_leave_the_cutoff_alone() {
        let (_, arbiter) = setup();
        let a = object(1);
        arbiter.select(&a);

        arbiter
            .apply(&GestureSample::new(Gesture::Pinch { scale: 2.0 }, 10))
            .unwrap();
        let err = arbiter
            .apply(&GestureSample::new(Gesture::Pinch { scale: -1.0 }, 50))
            .unwrap_err();
        assert!(matches!(err, ArStageError::InvalidInput(_)));

        let outcome = arbiter
            .apply(&GestureSample::new(Gesture::Pinch { scale: 1.5 }, 20))
            .unwrap();
        assert_eq!(outcome, SampleOutcome::Applied);
        assert_eq!(a.scale_factor(), 3.0);
    }

    #[test]
    fn samples_deserialize_from_scripts() {
        let json = r#"[
            { "kind": "start_rotate", "timestamp_ms": 0 },
            { "kind": "rotate", "angle": 0.5, "timestamp_ms": 16 },
            { "kind": "pinch", "scale": 1.25 }
        ]"#;
        let samples: Vec<GestureSample> = serde_json::from_str(json).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].gesture, Gesture::Rotate { angle: 0.5 });
        assert_eq!(samples[2].timestamp_ms, 0);
    }

    #[test]
    fn priority_suppresses_view_gestures_while_active() {
        let (_, arbiter) = setup();
        let a = object(1);
        a.set_control_priority(true);
        arbiter.select(&a);

        assert!(arbiter.allows(GestureTarget::View));
        arbiter.begin_gesture(GestureKind::Pinch).unwrap();
        assert!(!arbiter.allows(GestureTarget::View));
        assert!(arbiter.allows(GestureTarget::Object));
        assert!(!arbiter.recognize_simultaneously(GestureKind::Pan, GestureKind::Pinch));
        assert!(arbiter.recognize_simultaneously(GestureKind::Pinch, GestureKind::Rotate));

        arbiter.end_gesture();
        assert!(arbiter.allows(GestureTarget::View));
    }

    #[test]
    fn view_gestures_pass_without_priority() {
        let (_, arbiter) = setup();
        let a = object(1);
        arbiter.select(&a);
        arbiter.begin_gesture(GestureKind::Rotate).unwrap();

        assert!(arbiter.allows(GestureTarget::View));
        assert!(arbiter.recognize_simultaneously(GestureKind::Pan, GestureKind::Rotate));
    }
}
