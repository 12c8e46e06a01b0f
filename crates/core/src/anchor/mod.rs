use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use glam::{Mat4, Quat, Vec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    gesture::{ManipulableObject, TransformArbiter},
    scene::{NodeId, SceneGraph},
    Result,
};

/// Identifier the tracking engine assigns to an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorId(pub u64);

/// Identifier of a detected real-world surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(pub u64);

/// Tracked position and orientation of an anchor. Tracking never carries
/// scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorPose {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for AnchorPose {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl AnchorPose {
    /// Extracts translation and rotation; scale in `matrix` is ignored.
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let (_, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation: rotation.normalize(),
        }
    }
}

/// Result of a hit test against detected surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitTestResult {
    pub world_transform: Mat4,
    pub surface: SurfaceId,
}

/// Anchor management surface of the tracking engine.
pub trait AnchorTracker: Send + Sync {
    fn add_anchor(&self, pose: &AnchorPose) -> Result<AnchorId>;
    fn remove_anchor(&self, anchor: AnchorId);
}

/// In-process tracker that hands out sequential anchor ids and remembers the
/// poses it was given.
#[derive(Debug, Default)]
pub struct LocalAnchors {
    next: AtomicU64,
    anchors: Mutex<HashMap<AnchorId, AnchorPose>>,
}

impl LocalAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pose the anchor was created with, while it exists.
    pub fn pose(&self, anchor: AnchorId) -> Option<AnchorPose> {
        self.anchors.lock().get(&anchor).copied()
    }

    pub fn len(&self) -> usize {
        self.anchors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AnchorTracker for LocalAnchors {
    fn add_anchor(&self, pose: &AnchorPose) -> Result<AnchorId> {
        let anchor = AnchorId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.anchors.lock().insert(anchor, *pose);
        Ok(anchor)
    }

    fn remove_anchor(&self, anchor: AnchorId) {
        self.anchors.lock().remove(&anchor);
    }
}

/// Binds manipulable objects to anchors and keeps their node transforms in
/// step with tracking updates.
pub struct AnchorBinding {
    arbiter: Arc<TransformArbiter>,
    scene: Arc<dyn SceneGraph>,
    tracker: Arc<dyn AnchorTracker>,
    bound: Mutex<HashMap<AnchorId, Arc<ManipulableObject>>>,
}

impl std::fmt::Debug for AnchorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorBinding")
            .field("bound", &self.bound.lock().len())
            .finish()
    }
}

impl AnchorBinding {
    pub fn new(
        arbiter: Arc<TransformArbiter>,
        scene: Arc<dyn SceneGraph>,
        tracker: Arc<dyn AnchorTracker>,
    ) -> Self {
        Self {
            arbiter,
            scene,
            tracker,
            bound: Mutex::new(HashMap::new()),
        }
    }

    pub fn arbiter(&self) -> &Arc<TransformArbiter> {
        &self.arbiter
    }

    /// Places `node` at the hit-test pose, anchors it there and selects it.
    pub fn bind(&self, hit: &HitTestResult, node: NodeId) -> Result<Arc<ManipulableObject>> {
        let pose = AnchorPose::from_matrix(&hit.world_transform);
        let anchor = self.tracker.add_anchor(&pose)?;
        let object = Arc::new(ManipulableObject::new(node, anchor, pose, Vec3::ONE));

        self.scene.set_transform(node, &object.transform());
        self.bound.lock().insert(anchor, object.clone());
        self.arbiter.select(&object);

        tracing::info!(
            anchor = anchor.0,
            node = node.0,
            surface = hit.surface.0,
            "bound object to anchor"
        );
        Ok(object)
    }

    /// Re-syncs the object bound to `anchor` with its latest tracked pose.
    /// Returns false for anchors this binding does not know.
    pub fn on_anchor_updated(&self, anchor: AnchorId, pose: AnchorPose) -> bool {
        let object = match self.bound.lock().get(&anchor) {
            Some(object) => object.clone(),
            None => return false,
        };
        object.sync_anchor(pose, self.scene.as_ref());
        tracing::trace!(anchor = anchor.0, "anchor pose updated");
        true
    }

    /// Drops the object bound to an anchor the tracking engine stopped
    /// tracking.
    pub fn on_anchor_removed(&self, anchor: AnchorId) -> Option<Arc<ManipulableObject>> {
        let object = self.bound.lock().remove(&anchor)?;
        self.detach(&object);
        tracing::info!(anchor = anchor.0, "anchor lost, object removed");
        Some(object)
    }

    /// Explicitly removes `object`, releasing its anchor.
    pub fn remove(&self, object: &ManipulableObject) -> bool {
        let anchor = object.anchor();
        let removed = self.bound.lock().remove(&anchor);
        match removed {
            Some(object) => {
                self.tracker.remove_anchor(anchor);
                self.detach(&object);
                true
            }
            None => false,
        }
    }

    /// Object currently bound to `anchor`.
    pub fn object_for(&self, anchor: AnchorId) -> Option<Arc<ManipulableObject>> {
        self.bound.lock().get(&anchor).cloned()
    }

    pub fn len(&self) -> usize {
        self.bound.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn detach(&self, object: &ManipulableObject) {
        self.scene.remove_node(object.node());
        if self.arbiter.clear_if_selected(object) {
            tracing::debug!(object = object.id().0, "removed object was selected");
        }
    }
}
