use std::path::{Path, PathBuf};

use anyhow::Result;

use sgeval_comm::LocalCollective;
use sgeval_core::config::EvalConfig;
use sgeval_core::device::Device;
use sgeval_core::types::Prediction;
use sgeval_engine::cache::{CachedResults, RESULTS_FILE_NAME};
use sgeval_engine::driver::EvalDriver;
use sgeval_engine::model::{EvalOptions, Evaluator, HostBackend};
use sgeval_engine::synthetic::{
    SyntheticDataset, SyntheticDetector, SyntheticListener, SyntheticLoader,
};

struct Passthrough;

impl Evaluator<SyntheticDataset> for Passthrough {
    type Output = Vec<Prediction>;

    fn evaluate(
        &self,
        _dataset: &SyntheticDataset,
        predictions: &[Prediction],
        output_folder: Option<&Path>,
        _options: &EvalOptions,
    ) -> Result<Vec<Prediction>> {
        assert!(output_folder.is_some());
        Ok(predictions.to_vec())
    }
}

fn temp_dir(test_name: &str) -> PathBuf {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "sgeval-engine-{test_name}-{}-{}",
        std::process::id(),
        sgeval_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root).unwrap();
    root
}

fn write_cache(dir: &Path, predictions: Vec<Prediction>) {
    let stored = CachedResults { predictions };
    std::fs::write(
        dir.join(RESULTS_FILE_NAME),
        bincode::serialize(&stored).unwrap(),
    )
    .unwrap();
}

fn cfg(allow_load_from_cache: bool) -> EvalConfig {
    EvalConfig {
        device: Device::Cpu,
        allow_load_from_cache,
        ..EvalConfig::default()
    }
}

#[test]
fn cached_predictions_skip_the_detector() {
    let dir = temp_dir("cache-hit");
    // Deliberately not what the detector would produce.
    let stored = vec![Prediction::Loss(0.25), Prediction::Loss(0.75)];
    write_cache(&dir, stored.clone());

    let cfg = cfg(true);
    let mut loader = SyntheticLoader::for_rank(SyntheticDataset::new(5), 1, 0, 2).unwrap();
    let mut detector = SyntheticDetector::default();
    let out = EvalDriver::new(&cfg, &LocalCollective, &HostBackend, "cached")
        .with_output_folder(&dir)
        .inference(&mut detector, &mut loader, &Passthrough, &EvalOptions::default())
        .unwrap();

    assert_eq!(out, Some(stored));
    assert_eq!(detector.infer_calls, 0);
    assert!(!detector.eval_mode);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn cached_losses_feed_the_listener_mean() {
    let dir = temp_dir("cache-listener");
    write_cache(&dir, [1.0, 2.0, 3.0, 4.0, 5.0].map(Prediction::Loss).to_vec());

    let cfg = cfg(true);
    let mut loader = SyntheticLoader::for_rank(SyntheticDataset::new(5), 1, 0, 2).unwrap();
    let mut detector = SyntheticDetector::default();
    let mut listener = SyntheticListener::default();
    let mean = EvalDriver::new(&cfg, &LocalCollective, &HostBackend, "cached")
        .with_output_folder(&dir)
        .listener_inference(&mut detector, &mut listener, &mut loader)
        .unwrap();

    assert_eq!(mean, Some(7.5));
    assert_eq!(detector.graph_calls, 0);
    assert_eq!(listener.calls, 0);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn cache_file_is_ignored_when_loading_is_disabled() {
    let dir = temp_dir("cache-disabled");
    write_cache(&dir, vec![Prediction::Loss(9.0)]);

    let cfg = cfg(false);
    let mut loader = SyntheticLoader::for_rank(SyntheticDataset::new(3), 1, 0, 2).unwrap();
    let mut detector = SyntheticDetector::default();
    let out = EvalDriver::new(&cfg, &LocalCollective, &HostBackend, "fresh")
        .with_output_folder(&dir)
        .inference(&mut detector, &mut loader, &Passthrough, &EvalOptions::default())
        .unwrap()
        .unwrap();

    assert_eq!(out.len(), 3);
    assert!(out.iter().all(|p| p.as_boxes().is_some()));
    assert_eq!(detector.infer_calls, 2);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn missing_cache_file_falls_through_to_inference() {
    let dir = temp_dir("cache-miss");

    let cfg = cfg(true);
    let mut loader = SyntheticLoader::for_rank(SyntheticDataset::new(4), 1, 0, 4).unwrap();
    let mut detector = SyntheticDetector::default();
    let out = EvalDriver::new(&cfg, &LocalCollective, &HostBackend, "miss")
        .with_output_folder(&dir)
        .inference(&mut detector, &mut loader, &Passthrough, &EvalOptions::default())
        .unwrap()
        .unwrap();

    assert_eq!(out.len(), 4);
    assert_eq!(detector.infer_calls, 1);
    // Nothing is written back.
    assert!(!dir.join(RESULTS_FILE_NAME).exists());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn unreadable_cache_file_is_an_error() {
    let dir = temp_dir("cache-corrupt");
    std::fs::write(dir.join(RESULTS_FILE_NAME), b"garbage").unwrap();

    let cfg = cfg(true);
    let mut loader = SyntheticLoader::for_rank(SyntheticDataset::new(2), 1, 0, 2).unwrap();
    let mut detector = SyntheticDetector::default();
    let err = EvalDriver::new(&cfg, &LocalCollective, &HostBackend, "corrupt")
        .with_output_folder(&dir)
        .inference(&mut detector, &mut loader, &Passthrough, &EvalOptions::default())
        .unwrap_err();

    assert!(err.to_string().contains("not a results file"), "{err}");
    let _ = std::fs::remove_dir_all(dir);
}
