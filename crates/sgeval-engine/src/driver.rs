use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use sgeval_comm::Collective;
use sgeval_core::config::EvalConfig;
use sgeval_core::types::{Prediction, ResultsDict};
use sgeval_observe::metrics::DurationAgg;
use sgeval_observe::time::format_hms;

use crate::accumulate::accumulate_predictions;
use crate::cache::ResultCache;
use crate::inference::{compute_listener_on_dataset, compute_on_dataset, InferenceContext};
use crate::model::{Backend, DataLoader, Detector, EvalOptions, Evaluator, Listener};

/// Subtracted from the prediction count before averaging listener losses.
///
/// Undocumented constant. Changing it shifts every reported mean, so reported
/// numbers stay comparable only while it stays.
pub const LISTENER_LOSS_COUNT_OFFSET: f32 = 3.0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("prediction {index} is not a listener loss")]
    NotALoss { index: usize },
}

enum Source {
    Cached(Vec<Prediction>),
    Computed(ResultsDict),
}

/// Top-level evaluation of one dataset on one worker.
///
/// Every rank calls the same entry point; only the main process gets a result.
pub struct EvalDriver<'a, C: Collective> {
    cfg: &'a EvalConfig,
    collective: &'a C,
    backend: &'a dyn Backend,
    dataset_name: String,
    output_folder: Option<PathBuf>,
}

impl<'a, C: Collective> EvalDriver<'a, C> {
    pub fn new(
        cfg: &'a EvalConfig,
        collective: &'a C,
        backend: &'a dyn Backend,
        dataset_name: impl Into<String>,
    ) -> Self {
        Self {
            cfg,
            collective,
            backend,
            dataset_name: dataset_name.into(),
            output_folder: None,
        }
    }

    pub fn with_output_folder(mut self, output_folder: impl Into<PathBuf>) -> Self {
        self.output_folder = Some(output_folder.into());
        self
    }

    pub fn output_folder(&self) -> Option<&Path> {
        self.output_folder.as_deref()
    }

    /// Detector evaluation; the scorer's output is passed through on the main process.
    pub fn inference<D, L, E>(
        &self,
        detector: &mut D,
        loader: &mut L,
        evaluator: &E,
        options: &EvalOptions,
    ) -> Result<Option<E::Output>>
    where
        D: Detector,
        L: DataLoader,
        E: Evaluator<L::Dataset>,
    {
        let predictions = self.gather_predictions(loader, |ctx, loader, timer| {
            compute_on_dataset(detector, loader, ctx, timer)
        })?;
        let Some(predictions) = predictions else {
            return Ok(None);
        };

        let output =
            evaluator.evaluate(loader.dataset(), &predictions, self.output_folder(), options)?;
        Ok(Some(output))
    }

    /// Listener evaluation; returns the offset mean of the per-sample losses.
    pub fn listener_inference<D, S, L>(
        &self,
        detector: &mut D,
        listener: &mut S,
        loader: &mut L,
    ) -> Result<Option<f32>>
    where
        D: Detector,
        S: Listener,
        L: DataLoader,
    {
        let predictions = self.gather_predictions(loader, |ctx, loader, timer| {
            compute_listener_on_dataset(detector, listener, loader, ctx, timer)
        })?;
        let Some(predictions) = predictions else {
            return Ok(None);
        };
        Ok(Some(mean_listener_loss(&predictions)?))
    }

    fn gather_predictions<L, F>(
        &self,
        loader: &mut L,
        compute: F,
    ) -> Result<Option<Vec<Prediction>>>
    where
        L: DataLoader,
        F: FnOnce(&InferenceContext<'_, C>, &mut L, Option<&DurationAgg>) -> Result<ResultsDict>,
    {
        let dataset_len = loader.dataset_len();
        if self.collective.is_main_process() {
            info!(
                target: "sgeval_inference",
                dataset = %self.dataset_name,
                images = dataset_len as u64,
                "start evaluation"
            );
        }

        let ctx = InferenceContext {
            cfg: self.cfg,
            collective: self.collective,
            backend: self.backend,
        };
        let cache = ResultCache::new(self.output_folder.clone(), self.cfg.allow_load_from_cache);
        let inference_timer = DurationAgg::default();

        let started = Instant::now();
        let source = match cache.lookup() {
            Some(path) => {
                info!(
                    target: "sgeval_inference",
                    rank = self.collective.rank(),
                    path = %path.display(),
                    "loading predictions from cache"
                );
                Source::Cached(cache.load(&path)?)
            }
            None => Source::Computed(compute(&ctx, loader, Some(&inference_timer))?),
        };
        // Wait for every worker before measuring.
        self.collective.barrier()?;
        let total = started.elapsed();
        self.log_timings(total, inference_timer.total(), dataset_len);

        let predictions = match source {
            Source::Cached(predictions) => predictions,
            Source::Computed(per_worker) => {
                match accumulate_predictions(self.collective, per_worker, self.cfg.sync_gather)? {
                    Some(report) => report.predictions,
                    None => return Ok(None),
                }
            }
        };

        if !self.collective.is_main_process() {
            return Ok(None);
        }
        Ok(Some(predictions))
    }

    fn log_timings(&self, total: Duration, inference: Duration, dataset_len: usize) {
        if !self.collective.is_main_process() {
            return;
        }
        let devices = self.collective.world_size();
        info!(
            target: "sgeval_inference",
            dataset = %self.dataset_name,
            devices = devices as u64,
            "total run time: {} ({:.6} s / img per device, on {} devices)",
            format_hms(total),
            per_image_per_device(total, devices, dataset_len),
            devices
        );
        info!(
            target: "sgeval_inference",
            dataset = %self.dataset_name,
            devices = devices as u64,
            "model inference time: {} ({:.6} s / img per device, on {} devices)",
            format_hms(inference),
            per_image_per_device(inference, devices, dataset_len),
            devices
        );
    }
}

/// Seconds per image per device; zero for an empty dataset.
pub fn per_image_per_device(elapsed: Duration, devices: usize, dataset_len: usize) -> f64 {
    if dataset_len == 0 {
        return 0.0;
    }
    elapsed.as_secs_f64() * devices as f64 / dataset_len as f64
}

/// `sum(losses) / (count - 3)`.
///
/// The denominator is used as is, even when it is zero or negative; that case
/// is logged.
pub fn mean_listener_loss(predictions: &[Prediction]) -> Result<f32, DriverError> {
    let mut sum = 0.0f32;
    for (index, prediction) in predictions.iter().enumerate() {
        sum += prediction
            .as_loss()
            .ok_or(DriverError::NotALoss { index })?;
    }

    let denominator = predictions.len() as f32 - LISTENER_LOSS_COUNT_OFFSET;
    if denominator <= 0.0 {
        warn!(
            target: "sgeval_inference",
            predictions = predictions.len() as u64,
            denominator = denominator as f64,
            "listener loss denominator is not positive"
        );
    }
    Ok(sum / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_loss_uses_offset_denominator() {
        let preds: Vec<Prediction> = [1.0, 2.0, 3.0, 4.0, 5.0]
            .into_iter()
            .map(Prediction::Loss)
            .collect();
        // 15 / (5 - 3)
        assert_eq!(mean_listener_loss(&preds).unwrap(), 7.5);
    }

    #[test]
    fn mean_loss_with_three_predictions_is_not_finite() {
        let preds = vec![Prediction::Loss(1.0); 3];
        assert!(!mean_listener_loss(&preds).unwrap().is_finite());
    }

    #[test]
    fn mean_loss_rejects_box_predictions() {
        use sgeval_core::boxes::{BoxList, BoxMode};
        use sgeval_core::device::Device;
        use sgeval_core::tensor::Tensor;

        let boxes = BoxList::new(Tensor::full(&[0, 4], 0.0, Device::Cpu), (1, 1), BoxMode::Xyxy)
            .unwrap();
        let preds = vec![Prediction::Loss(1.0), Prediction::Boxes(boxes)];
        assert_eq!(
            mean_listener_loss(&preds).unwrap_err(),
            DriverError::NotALoss { index: 1 }
        );
    }

    #[test]
    fn per_image_time_scales_with_devices() {
        let t = per_image_per_device(Duration::from_secs(10), 2, 4);
        assert!((t - 5.0).abs() < 1e-9);
        assert_eq!(per_image_per_device(Duration::from_secs(10), 2, 0), 0.0);
    }
}
