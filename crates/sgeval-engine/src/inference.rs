use anyhow::Result;
use tracing::{debug, info};

use sgeval_comm::Collective;
use sgeval_core::boxes::BoxList;
use sgeval_core::config::EvalConfig;
use sgeval_core::device::Device;
use sgeval_core::graph::SceneGraphLayout;
use sgeval_core::image_list::ImageList;
use sgeval_core::types::{Batch, Prediction, ResultsDict, SampleId};
use sgeval_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};

use crate::collate::collate_scene_graphs;
use crate::model::{Backend, DataLoader, Detector, Listener};
use crate::preprocess::{resize_batch, stack_images};
use crate::scores::listener_loss;

/// Everything a worker needs besides the models and its data shard.
pub struct InferenceContext<'a, C: Collective> {
    pub cfg: &'a EvalConfig,
    pub collective: &'a C,
    pub backend: &'a dyn Backend,
}

impl<C: Collective> InferenceContext<'_, C> {
    pub fn device(&self) -> Device {
        self.cfg.device
    }
}

#[derive(Debug, Default)]
pub struct InferenceMetrics {
    pub batches_total: Counter,
    pub samples_total: Counter,
    pub gathers_total: Counter,
    pub results_len: Gauge,
}

/// Runs the detector over this worker's shard.
///
/// With `sync_gather` every batch ends with a barrier and an all-gather, and
/// only the main process keeps the merged results; every rank must therefore
/// see the same number of batches.
pub fn compute_on_dataset<C, D, L>(
    detector: &mut D,
    loader: &mut L,
    ctx: &InferenceContext<'_, C>,
    timer: Option<&DurationAgg>,
) -> Result<ResultsDict>
where
    C: Collective,
    D: Detector,
    L: DataLoader,
{
    let cfg = ctx.cfg;
    let device = ctx.device();
    detector.set_eval();

    drive(ctx, loader, |batch| {
        let Batch { images, targets, .. } = batch;
        let targets = to_device(targets, device);
        let images = ImageList::from_tensors(&images, cfg.size_divisibility)?.to(device);

        let timing = timer.map(ScopedTimer::new);
        let output = if cfg.bbox_aug_enabled {
            detector.infer_augmented(&images)?
        } else {
            detector.infer(&images, &targets)?
        };
        stop_timer(ctx, timing)?;

        Ok(output
            .into_iter()
            .map(|o| Prediction::Boxes(o.to(Device::Cpu)))
            .collect())
    })
}

/// Scores every sample's scene graph against its whole batch with the listener.
///
/// Each sample's prediction is its listener loss, with the sample itself as the
/// correct candidate.
pub fn compute_listener_on_dataset<C, D, S, L>(
    detector: &mut D,
    listener: &mut S,
    loader: &mut L,
    ctx: &InferenceContext<'_, C>,
    timer: Option<&DurationAgg>,
) -> Result<ResultsDict>
where
    C: Collective,
    D: Detector,
    S: Listener,
    L: DataLoader,
{
    let cfg = ctx.cfg;
    let device = ctx.device();
    detector.set_eval();

    drive(ctx, loader, |batch| {
        let Batch { images, targets, .. } = batch;

        // The detector sees `images` at native resolution; the listener sees
        // the square copies.
        let resized = resize_batch(&images, cfg.listener.image_size)?;
        let stacked = stack_images(&resized, device)?;
        let targets = to_device(targets, device);

        let timing = timer.map(ScopedTimer::new);
        let output = if cfg.bbox_aug_enabled {
            let list = ImageList::from_tensors(&resized, 0)?.to(device);
            detector
                .infer_augmented(&list)?
                .into_iter()
                .map(Prediction::Boxes)
                .collect()
        } else {
            let mut rows = Vec::with_capacity(images.len());
            for (image, target) in images.iter().zip(&targets) {
                let input =
                    ImageList::from_tensors(std::slice::from_ref(image), cfg.size_divisibility)?
                        .to(device);
                rows.push(detector.infer_with_graph(&input, target)?);
            }
            let graphs = collate_scene_graphs(SceneGraphLayout::Rows(rows), device)?;

            let mut losses = Vec::with_capacity(graphs.len());
            for (true_index, graph) in graphs.iter().enumerate() {
                let scores = listener.score(graph, &stacked)?;
                let loss = listener_loss(cfg.listener.loss, &scores, true_index, device)?;
                losses.push(Prediction::Loss(loss));
            }
            losses
        };
        stop_timer(ctx, timing)?;

        Ok(output.into_iter().map(|p| p.to(Device::Cpu)).collect())
    })
}

/// Shared batch loop: cache management, bookkeeping and per-batch gathering.
fn drive<C, L, F>(
    ctx: &InferenceContext<'_, C>,
    loader: &mut L,
    mut step: F,
) -> Result<ResultsDict>
where
    C: Collective,
    L: DataLoader,
    F: FnMut(Batch) -> Result<Vec<Prediction>>,
{
    let device = ctx.device();
    let metrics = InferenceMetrics::default();
    let mut results = ResultsDict::new();

    ctx.backend.empty_cache(device);
    while let Some(batch) = loader.next_batch()? {
        batch.validate()?;
        let sample_ids = batch.sample_ids.clone();
        let output = step(batch)?;
        anyhow::ensure!(
            output.len() == sample_ids.len(),
            "model returned {} outputs for a batch of {} samples",
            output.len(),
            sample_ids.len()
        );

        metrics.batches_total.inc();
        metrics.samples_total.inc_by(sample_ids.len() as u64);
        debug!(
            target: "sgeval_inference",
            rank = ctx.collective.rank(),
            batch = metrics.batches_total.get(),
            samples = sample_ids.len() as u64,
            "batch done"
        );

        commit_batch(ctx, &metrics, &mut results, &sample_ids, output)?;
    }
    ctx.backend.empty_cache(device);

    info!(
        target: "sgeval_metrics",
        rank = ctx.collective.rank(),
        world_size = ctx.collective.world_size(),
        batches_total = metrics.batches_total.get(),
        samples_total = metrics.samples_total.get(),
        gathers_total = metrics.gathers_total.get(),
        results_len = metrics.results_len.get(),
        "inference loop finished"
    );
    Ok(results)
}

fn commit_batch<C: Collective>(
    ctx: &InferenceContext<'_, C>,
    metrics: &InferenceMetrics,
    results: &mut ResultsDict,
    sample_ids: &[SampleId],
    output: Vec<Prediction>,
) -> Result<()> {
    let partial: ResultsDict = sample_ids.iter().copied().zip(output).collect();

    if ctx.cfg.sync_gather {
        ctx.collective.barrier()?;
        let parts = ctx.collective.all_gather(partial)?;
        metrics.gathers_total.inc();
        if ctx.collective.is_main_process() {
            for part in parts {
                results.extend(part);
            }
        }
    } else {
        results.extend(partial);
    }

    metrics.results_len.set(results.len() as u64);
    Ok(())
}

fn to_device(targets: Vec<BoxList>, device: Device) -> Vec<BoxList> {
    targets.into_iter().map(|t| t.to(device)).collect()
}

/// Waits for the device before the timer stops, so it measures compute and not
/// just kernel launches.
fn stop_timer<C: Collective>(
    ctx: &InferenceContext<'_, C>,
    timing: Option<ScopedTimer<'_>>,
) -> Result<()> {
    if let Some(timing) = timing {
        if !ctx.device().is_cpu() {
            ctx.backend.synchronize(ctx.device())?;
        }
        timing.finish();
    }
    Ok(())
}
