//! Deterministic stand-ins for the detector, listener, loader and scorer.
//!
//! Every output depends only on the sample's own pixels, so results do not
//! change with batch size, padding, sharding or worker count.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::Result;
use ndarray::{s, Array1, Array2, Array3, ArrayView, Axis, Dimension};

use sgeval_core::boxes::{BoxList, BoxMode};
use sgeval_core::device::Device;
use sgeval_core::graph::{RawSceneGraph, SceneGraph};
use sgeval_core::image_list::ImageList;
use sgeval_core::tensor::Tensor;
use sgeval_core::types::{Batch, Prediction, SampleId, ShardError, ShardPlan};

use crate::model::{DataLoader, Detector, EvalOptions, Evaluator, Listener};

const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticDataset {
    pub len: usize,
}

impl SyntheticDataset {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    /// `(C, H, W)` image in `[0, 1]`; sizes vary with the id.
    pub fn image(&self, id: SampleId) -> Tensor<f32> {
        let (h, w) = Self::size(id);
        let data = Array3::from_shape_fn((CHANNELS, h, w), |(c, y, x)| {
            let v = (id as usize * 31 + c * 7 + y * 3 + x) % 256;
            v as f32 / 255.0
        });
        Tensor::new(data.into_dyn(), Device::Cpu)
    }

    pub fn target(&self, id: SampleId) -> BoxList {
        let (h, w) = Self::size(id);
        whole_image_box(w, h, (id % 10) as f32, None)
    }

    fn size(id: SampleId) -> (usize, usize) {
        (16 + (id % 5) as usize * 3, 20 + (id % 3) as usize * 4)
    }
}

fn whole_image_box(w: usize, h: usize, label: f32, score: Option<f32>) -> BoxList {
    let boxes = Array2::from_shape_vec((1, 4), vec![0.0, 0.0, w as f32, h as f32])
        .unwrap_or_else(|_| Array2::zeros((1, 4)));
    let mut list = BoxList {
        boxes: Tensor::new(boxes.into_dyn(), Device::Cpu),
        image_size: (w as u32, h as u32),
        mode: BoxMode::Xyxy,
        fields: Default::default(),
    };
    list.fields.insert(
        "labels".to_string(),
        Tensor::new(Array1::from(vec![label]).into_dyn(), Device::Cpu),
    );
    if let Some(score) = score {
        list.fields.insert(
            "scores".to_string(),
            Tensor::new(Array1::from(vec![score]).into_dyn(), Device::Cpu),
        );
    }
    list
}

/// Mean in logical element order, independent of memory layout.
fn ordered_mean<D: Dimension>(view: ArrayView<'_, f32, D>) -> f32 {
    let n = view.len();
    if n == 0 {
        return 0.0;
    }
    (view.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64) as f32
}

/// Loader over a fixed list of ids, usually one rank's shard.
#[derive(Debug, Clone)]
pub struct SyntheticLoader {
    dataset: SyntheticDataset,
    pending: VecDeque<SampleId>,
    batch_size: usize,
}

impl SyntheticLoader {
    pub fn from_ids(dataset: SyntheticDataset, ids: Vec<SampleId>, batch_size: usize) -> Self {
        Self {
            dataset,
            pending: ids.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn for_rank(
        dataset: SyntheticDataset,
        world_size: usize,
        rank: usize,
        batch_size: usize,
    ) -> Result<Self, ShardError> {
        let plan = ShardPlan::new(dataset.len as u64, world_size)?;
        Ok(Self::from_ids(dataset, plan.sample_ids(rank)?, batch_size))
    }
}

impl DataLoader for SyntheticLoader {
    type Dataset = SyntheticDataset;

    fn dataset(&self) -> &SyntheticDataset {
        &self.dataset
    }

    fn dataset_len(&self) -> usize {
        self.dataset.len
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.batch_size.min(self.pending.len());
        let sample_ids: Vec<SampleId> = self.pending.drain(..take).collect();
        Ok(Some(Batch {
            images: sample_ids.iter().map(|&id| self.dataset.image(id)).collect(),
            targets: sample_ids.iter().map(|&id| self.dataset.target(id)).collect(),
            sample_ids,
        }))
    }
}

/// Scores each image by its mean intensity.
#[derive(Debug, Default)]
pub struct SyntheticDetector {
    pub eval_mode: bool,
    pub infer_calls: usize,
    pub graph_calls: usize,
}

impl SyntheticDetector {
    fn detections(&self, images: &ImageList, labels: &[f32]) -> Vec<BoxList> {
        images
            .image_sizes
            .iter()
            .enumerate()
            .map(|(i, &(h, w))| {
                let region = images.tensors.data.slice(s![i, .., ..h, ..w]);
                let score = ordered_mean(region);
                let label = labels.get(i).copied().unwrap_or(0.0);
                whole_image_box(w, h, label, Some(score)).to(images.tensors.device)
            })
            .collect()
    }
}

impl Detector for SyntheticDetector {
    fn set_eval(&mut self) {
        self.eval_mode = true;
    }

    fn infer(&mut self, images: &ImageList, targets: &[BoxList]) -> Result<Vec<BoxList>> {
        self.infer_calls += 1;
        let labels: Vec<f32> = targets
            .iter()
            .map(|t| t.field("labels").and_then(|l| l.to_vec().first().copied()).unwrap_or(0.0))
            .collect();
        Ok(self.detections(images, &labels))
    }

    fn infer_augmented(&mut self, images: &ImageList) -> Result<Vec<BoxList>> {
        self.infer_calls += 1;
        Ok(self.detections(images, &[]))
    }

    fn infer_with_graph(&mut self, image: &ImageList, _target: &BoxList) -> Result<RawSceneGraph> {
        self.graph_calls += 1;
        let (h, w) = image
            .image_sizes
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("empty image list"))?;
        let device = image.tensors.device;
        let region = image.tensors.data.slice(s![0, .., ..h, ..w]);

        // One node per channel, featurized by the channel mean.
        let means: Vec<f32> = region
            .axis_iter(Axis(0))
            .map(ordered_mean)
            .collect();
        let n = means.len();
        let nodes = Array2::from_shape_fn((n, 2), |(k, j)| if j == 0 { means[k] } else { 1.0 });
        let pairs = Array2::from_shape_fn((n, 2), |(e, j)| ((e + j) % n) as i64);
        let edges = Array2::from_shape_fn((n, 1), |(e, _)| means[(e + 1) % n] - means[e]);

        Ok(RawSceneGraph::singleton(
            Tensor::new(nodes.into_dyn(), device),
            Tensor::new(pairs.into_dyn(), device),
            Tensor::new(edges.into_dyn(), device),
        ))
    }
}

/// Scores a graph against each image by how close their mean intensities are.
#[derive(Debug, Default)]
pub struct SyntheticListener {
    pub calls: usize,
}

impl Listener for SyntheticListener {
    fn score(&mut self, graph: &SceneGraph, images: &Tensor<f32>) -> Result<Tensor<f32>> {
        self.calls += 1;
        let g = ordered_mean(graph.nodes.data.index_axis(Axis(1), 0));
        let scores: Vec<f32> = images
            .data
            .axis_iter(Axis(0))
            .map(|img| {
                let m = ordered_mean(img);
                -(g - m) * (g - m)
            })
            .collect();
        let len = scores.len();
        Ok(Tensor::new(
            Array2::from_shape_vec((len, 1), scores)?.into_dyn(),
            images.device,
        ))
    }
}

/// Mean detection score over all predictions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanScoreEvaluator;

impl Evaluator<SyntheticDataset> for MeanScoreEvaluator {
    type Output = f64;

    fn evaluate(
        &self,
        _dataset: &SyntheticDataset,
        predictions: &[Prediction],
        _output_folder: Option<&Path>,
        _options: &EvalOptions,
    ) -> Result<f64> {
        let mut sum = 0.0f64;
        let mut count = 0usize;
        for (index, prediction) in predictions.iter().enumerate() {
            let boxes = prediction
                .as_boxes()
                .ok_or_else(|| anyhow::anyhow!("prediction {index} carries no boxes"))?;
            if let Some(scores) = boxes.field("scores") {
                sum += scores.to_vec().iter().map(|&v| f64::from(v)).sum::<f64>();
                count += scores.numel();
            }
        }
        Ok(if count == 0 { 0.0 } else { sum / count as f64 })
    }
}
