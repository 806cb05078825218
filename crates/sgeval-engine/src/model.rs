//! Interfaces of the collaborators the engine drives but does not own: the
//! detector, the listener, the accelerator runtime, the data loader and the
//! metric scorer.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use sgeval_core::boxes::BoxList;
use sgeval_core::device::Device;
use sgeval_core::graph::{RawSceneGraph, SceneGraph};
use sgeval_core::image_list::ImageList;
use sgeval_core::tensor::Tensor;
use sgeval_core::types::{Batch, Prediction};

/// Scene-graph detector.
///
/// Forward passes are expected to succeed for well-formed input; device and
/// out-of-memory failures are returned as errors and abort the worker.
pub trait Detector {
    /// Switches off stochastic layers and freezes normalization statistics.
    fn set_eval(&mut self);

    /// One output per image of `images`.
    fn infer(&mut self, images: &ImageList, targets: &[BoxList]) -> Result<Vec<BoxList>>;

    /// Test-time augmented detection.
    fn infer_augmented(&mut self, images: &ImageList) -> Result<Vec<BoxList>>;

    /// Scene graph of a single-image batch, singleton-wrapped.
    fn infer_with_graph(&mut self, image: &ImageList, target: &BoxList) -> Result<RawSceneGraph>;
}

/// Scores one scene graph against every image of a batch.
pub trait Listener {
    /// Returns `(B,)` or `(B, 1)` similarity scores for the `B` images.
    fn score(&mut self, graph: &SceneGraph, images: &Tensor<f32>) -> Result<Tensor<f32>>;
}

/// Accelerator runtime hooks.
pub trait Backend: Send + Sync {
    /// Blocks until all queued work on `device` has completed.
    fn synchronize(&self, device: Device) -> Result<()>;

    /// Returns cached, unused allocations on `device` to the driver.
    fn empty_cache(&self, device: Device);
}

/// Backend for host-only runs: nothing is queued, nothing is cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl Backend for HostBackend {
    fn synchronize(&self, _device: Device) -> Result<()> {
        Ok(())
    }

    fn empty_cache(&self, _device: Device) {}
}

/// This worker's shard of the evaluation dataset.
pub trait DataLoader {
    type Dataset;

    fn dataset(&self) -> &Self::Dataset;

    /// Size of the whole dataset, not just this shard.
    fn dataset_len(&self) -> usize;

    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IouType {
    Bbox,
    Segm,
    Relations,
}

/// A metric the scorer is expected to reproduce within `sigma` standard deviations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedResult {
    pub task: String,
    pub metric: String,
    pub value: f64,
    pub sigma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOptions {
    pub box_only: bool,
    pub iou_types: Vec<IouType>,
    pub expected_results: Vec<ExpectedResult>,
    pub expected_results_sigma_tol: u32,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            box_only: false,
            iou_types: vec![IouType::Bbox],
            expected_results: Vec::new(),
            expected_results_sigma_tol: 4,
        }
    }
}

/// Final metric computation over the gathered predictions.
pub trait Evaluator<D> {
    type Output;

    fn evaluate(
        &self,
        dataset: &D,
        predictions: &[Prediction],
        output_folder: Option<&Path>,
        options: &EvalOptions,
    ) -> Result<Self::Output>;
}
