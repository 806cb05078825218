use thiserror::Error;

use sgeval_core::device::Device;
use sgeval_core::graph::{RawSceneGraph, SceneGraph, SceneGraphLayout};
use sgeval_core::tensor::{Tensor, TensorError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollateError {
    #[error("scene graph row {row} has an empty {position} batch")]
    EmptySingleton { row: usize, position: &'static str },
    #[error("columnar scene graph has {nodes} node, {pairs} pair and {edges} edge tensors")]
    ColumnLengthMismatch {
        nodes: usize,
        pairs: usize,
        edges: usize,
    },
    #[error("edge index of sample {sample}: {source}")]
    EdgeIndex {
        sample: usize,
        #[source]
        source: TensorError,
    },
}

/// Normalizes a batch of scene graphs into one collated triple per sample on
/// `device`, with every edge index transposed to `(2, E)` and contiguous.
pub fn collate_scene_graphs(
    layout: SceneGraphLayout,
    device: Device,
) -> Result<Vec<SceneGraph>, CollateError> {
    match layout {
        SceneGraphLayout::Rows(rows) => rows
            .into_iter()
            .enumerate()
            .map(|(row, raw)| {
                let (nodes, pairs, edges) = first_of_each(raw, row)?;
                collate_one(row, nodes, pairs, edges, device)
            })
            .collect(),
        SceneGraphLayout::Columns(RawSceneGraph {
            nodes,
            pair_idx,
            edges,
        }) => {
            if nodes.len() != pair_idx.len() || nodes.len() != edges.len() {
                return Err(CollateError::ColumnLengthMismatch {
                    nodes: nodes.len(),
                    pairs: pair_idx.len(),
                    edges: edges.len(),
                });
            }
            nodes
                .into_iter()
                .zip(pair_idx)
                .zip(edges)
                .enumerate()
                .map(|(sample, ((nodes, pairs), edges))| {
                    collate_one(sample, nodes, pairs, edges, device)
                })
                .collect()
        }
    }
}

fn first_of_each(
    raw: RawSceneGraph,
    row: usize,
) -> Result<(Tensor<f32>, Tensor<i64>, Tensor<f32>), CollateError> {
    let empty = |position| CollateError::EmptySingleton { row, position };
    let nodes = raw.nodes.into_iter().next().ok_or_else(|| empty("node"))?;
    let pairs = raw.pair_idx.into_iter().next().ok_or_else(|| empty("pair"))?;
    let edges = raw.edges.into_iter().next().ok_or_else(|| empty("edge"))?;
    Ok((nodes, pairs, edges))
}

fn collate_one(
    sample: usize,
    nodes: Tensor<f32>,
    pairs: Tensor<i64>,
    edges: Tensor<f32>,
    device: Device,
) -> Result<SceneGraph, CollateError> {
    let edge_index = pairs
        .t()
        .map_err(|source| CollateError::EdgeIndex { sample, source })?
        .contiguous()
        .to(device);
    Ok(SceneGraph {
        nodes: nodes.to(device),
        edge_index,
        edge_features: edges.to(device),
    })
}
