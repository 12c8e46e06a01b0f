use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Identifier of a node owned by the renderer's scene graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Rigid-body transform with non-uniform scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_matrix(matrix: &Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
            scale,
        }
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// Mutation surface of the renderer's scene graph. The renderer owns the node
/// tree; the core only writes transforms and removes nodes it bound.
pub trait SceneGraph: Send + Sync {
    fn set_transform(&self, node: NodeId, transform: &Transform);
    fn remove_node(&self, node: NodeId);
}

/// In-process scene graph that keeps the latest transform for each node.
#[derive(Debug, Default)]
pub struct SceneStore {
    nodes: Mutex<HashMap<NodeId, Transform>>,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last transform pushed for `node`.
    pub fn transform(&self, node: NodeId) -> Option<Transform> {
        self.nodes.lock().get(&node).copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.lock().contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SceneGraph for SceneStore {
    fn set_transform(&self, node: NodeId, transform: &Transform) {
        self.nodes.lock().insert(node, *transform);
    }

    fn remove_node(&self, node: NodeId) {
        self.nodes.lock().remove(&node);
    }
}
