use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use sgeval_comm::LocalCollective;
use sgeval_core::config::EvalConfig;
use sgeval_core::device::Device;
use sgeval_core::types::Prediction;
use sgeval_engine::driver::EvalDriver;
use sgeval_engine::model::{EvalOptions, Evaluator, HostBackend};
use sgeval_engine::synthetic::{SyntheticDataset, SyntheticDetector, SyntheticLoader};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Passthrough;

impl Evaluator<SyntheticDataset> for Passthrough {
    type Output = Vec<Prediction>;

    fn evaluate(
        &self,
        _dataset: &SyntheticDataset,
        predictions: &[Prediction],
        _output_folder: Option<&Path>,
        _options: &EvalOptions,
    ) -> Result<Vec<Prediction>> {
        Ok(predictions.to_vec())
    }
}

fn run_with_ids(ids: Vec<u64>) -> (Vec<Prediction>, String) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();

    let cfg = EvalConfig {
        device: Device::Cpu,
        ..EvalConfig::default()
    };
    let preds = tracing::subscriber::with_default(subscriber, || {
        let mut loader = SyntheticLoader::from_ids(SyntheticDataset::new(4), ids, 2);
        let mut detector = SyntheticDetector::default();
        EvalDriver::new(&cfg, &LocalCollective, &HostBackend, "gappy")
            .inference(&mut detector, &mut loader, &Passthrough, &EvalOptions::default())
            .unwrap()
            .unwrap()
    });
    (preds, captured.text())
}

#[test]
fn missing_ids_are_compacted_with_a_warning() {
    let ds = SyntheticDataset::new(4);
    let (preds, logs) = run_with_ids(vec![0, 1, 3]);

    assert_eq!(preds.len(), 3);
    // Sample 3 moved up into position 2.
    let last = preds[2].as_boxes().unwrap();
    assert_eq!(last.image_size, ds.target(3).image_size);
    assert!(logs.contains("WARN"), "{logs}");
    assert!(logs.contains("not a contiguous set"), "{logs}");
    assert!(logs.contains("sample_id=2"), "{logs}");
}

#[test]
fn contiguous_ids_log_no_warning() {
    let (preds, logs) = run_with_ids(vec![2, 0, 1, 3]);
    assert_eq!(preds.len(), 4);
    assert!(!logs.contains("WARN"), "{logs}");
    assert!(logs.contains("total run time"), "{logs}");
    assert!(logs.contains("model inference time"), "{logs}");
}
