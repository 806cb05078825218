use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::tensor::Tensor;

/// Collated scene graph of a single image.
///
/// Invariant: `edge_index` has shape `(2, E)` and is contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneGraph {
    pub nodes: Tensor<f32>,
    pub edge_index: Tensor<i64>,
    pub edge_features: Tensor<f32>,
}

impl SceneGraph {
    pub fn num_nodes(&self) -> usize {
        self.nodes.shape().first().copied().unwrap_or(0)
    }

    pub fn num_edges(&self) -> usize {
        self.edge_index.shape().get(1).copied().unwrap_or(0)
    }

    pub fn device(&self) -> Device {
        self.nodes.device
    }
}

/// Scene graph triple as the detector emits it: each position holds one
/// tensor per sample, and `pair_idx` tensors are `(E, 2)`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSceneGraph {
    pub nodes: Vec<Tensor<f32>>,
    pub pair_idx: Vec<Tensor<i64>>,
    pub edges: Vec<Tensor<f32>>,
}

impl RawSceneGraph {
    pub fn singleton(nodes: Tensor<f32>, pair_idx: Tensor<i64>, edges: Tensor<f32>) -> Self {
        Self {
            nodes: vec![nodes],
            pair_idx: vec![pair_idx],
            edges: vec![edges],
        }
    }
}

/// The two batch layouts collation accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneGraphLayout {
    /// One singleton-wrapped triple per sample.
    Rows(Vec<RawSceneGraph>),
    /// One triple whose positions run across samples.
    Columns(RawSceneGraph),
}

impl SceneGraphLayout {
    pub fn len(&self) -> usize {
        match self {
            SceneGraphLayout::Rows(rows) => rows.len(),
            SceneGraphLayout::Columns(cols) => cols.nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
