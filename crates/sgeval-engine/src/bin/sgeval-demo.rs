#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{info, info_span};

use sgeval_comm::{thread_group, Collective, TcpCollective};
use sgeval_core::config::{EvalConfig, ListenerLoss};
use sgeval_core::device::Device;
use sgeval_engine::driver::EvalDriver;
use sgeval_engine::model::{EvalOptions, HostBackend};
use sgeval_engine::synthetic::{
    MeanScoreEvaluator, SyntheticDataset, SyntheticDetector, SyntheticListener, SyntheticLoader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Launcher {
    /// One worker thread per rank in this process.
    Threads,
    /// This process is a single rank; rank 0 hosts at `--master-addr`.
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Detector,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LossArg {
    MarginRanking,
    Regression,
}

impl From<LossArg> for ListenerLoss {
    fn from(value: LossArg) -> Self {
        match value {
            LossArg::MarginRanking => ListenerLoss::MarginRanking,
            LossArg::Regression => ListenerLoss::Regression,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "sgeval-demo")]
struct Args {
    /// Optional JSON `EvalConfig`; flags below override its fields.
    #[arg(long, env = "SGEVAL_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "SGEVAL_DATASET_NAME", default_value = "synthetic")]
    dataset_name: String,

    #[arg(long, env = "SGEVAL_TOTAL_SAMPLES", default_value_t = 64)]
    total_samples: usize,

    #[arg(long, env = "SGEVAL_BATCH_SIZE", default_value_t = 4)]
    batch_size: usize,

    #[arg(long, env = "SGEVAL_WORLD_SIZE", default_value_t = 1)]
    world_size: usize,

    #[arg(long, value_enum, env = "SGEVAL_LAUNCHER", default_value = "threads")]
    launcher: Launcher,

    /// Rank of this process (tcp launcher only).
    #[arg(long, env = "SGEVAL_RANK", default_value_t = 0)]
    rank: usize,

    #[arg(long, env = "SGEVAL_MASTER_ADDR", default_value = "127.0.0.1:29500")]
    master_addr: SocketAddr,

    #[arg(long, env = "SGEVAL_CONNECT_TIMEOUT_MS", default_value_t = 30_000)]
    connect_timeout_ms: u64,

    #[arg(long, value_enum, env = "SGEVAL_MODE", default_value = "detector")]
    mode: Mode,

    #[arg(long, env = "SGEVAL_DEVICE")]
    device: Option<Device>,

    #[arg(long, env = "SGEVAL_SYNC_GATHER", action = ArgAction::Set)]
    sync_gather: Option<bool>,

    #[arg(long, env = "SGEVAL_ALLOW_LOAD_FROM_CACHE", action = ArgAction::Set)]
    allow_load_from_cache: Option<bool>,

    #[arg(long, env = "SGEVAL_BBOX_AUG", action = ArgAction::Set)]
    bbox_aug: Option<bool>,

    #[arg(long, env = "SGEVAL_LISTENER_IMAGE_SIZE")]
    listener_image_size: Option<u32>,

    #[arg(long, value_enum, env = "SGEVAL_LISTENER_LOSS")]
    listener_loss: Option<LossArg>,

    #[arg(long, env = "SGEVAL_OUTPUT_FOLDER")]
    output_folder: Option<PathBuf>,
}

impl Args {
    fn eval_config(&self) -> Result<EvalConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let raw = std::fs::read(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => EvalConfig {
                device: Device::Cpu,
                ..EvalConfig::default()
            },
        };
        if let Some(device) = self.device {
            cfg.device = device;
        }
        if let Some(v) = self.sync_gather {
            cfg.sync_gather = v;
        }
        if let Some(v) = self.allow_load_from_cache {
            cfg.allow_load_from_cache = v;
        }
        if let Some(v) = self.bbox_aug {
            cfg.bbox_aug_enabled = v;
        }
        if let Some(v) = self.listener_image_size {
            cfg.listener.image_size = v;
        }
        if let Some(v) = self.listener_loss {
            cfg.listener.loss = v.into();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Evaluation result as reported by the main process.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    MeanScore(f64),
    ListenerLoss(f32),
}

fn run_worker<C: Collective>(
    args: &Args,
    cfg: &EvalConfig,
    collective: &C,
) -> Result<Option<Outcome>> {
    let dataset = SyntheticDataset::new(args.total_samples);
    let mut loader = SyntheticLoader::for_rank(
        dataset,
        collective.world_size(),
        collective.rank(),
        args.batch_size,
    )?;
    let backend = HostBackend;
    let mut driver = EvalDriver::new(cfg, collective, &backend, args.dataset_name.clone());
    if let Some(dir) = &args.output_folder {
        driver = driver.with_output_folder(dir.clone());
    }

    let mut detector = SyntheticDetector::default();
    match args.mode {
        Mode::Detector => Ok(driver
            .inference(
                &mut detector,
                &mut loader,
                &MeanScoreEvaluator,
                &EvalOptions::default(),
            )?
            .map(Outcome::MeanScore)),
        Mode::Listener => {
            let mut listener = SyntheticListener::default();
            Ok(driver
                .listener_inference(&mut detector, &mut listener, &mut loader)?
                .map(Outcome::ListenerLoss))
        }
    }
}

fn run_threads(args: &Args, cfg: &EvalConfig) -> Result<Option<Outcome>> {
    let group = thread_group(args.world_size)?;
    std::thread::scope(|scope| -> Result<Option<Outcome>> {
        let handles: Vec<_> = group
            .into_iter()
            .map(|collective| scope.spawn(move || run_worker(args, cfg, &collective)))
            .collect();

        let mut main_outcome = None;
        for (rank, handle) in handles.into_iter().enumerate() {
            let outcome = handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker {rank} panicked"))??;
            if rank == 0 {
                main_outcome = outcome;
            }
        }
        Ok(main_outcome)
    })
}

fn run_tcp(args: &Args, cfg: &EvalConfig) -> Result<Option<Outcome>> {
    let collective = if args.rank == 0 {
        let listener = TcpListener::bind(args.master_addr)
            .with_context(|| format!("binding {}", args.master_addr))?;
        TcpCollective::host(listener, args.world_size)?
    } else {
        TcpCollective::join(
            args.master_addr,
            args.rank,
            args.world_size,
            Duration::from_millis(args.connect_timeout_ms),
        )?
    };
    run_worker(args, cfg, &collective)
}

fn main() -> Result<()> {
    sgeval_observe::logging::init_tracing();
    let args = Args::parse();
    let cfg = args.eval_config()?;

    let _span = info_span!(
        "sgeval-demo",
        dataset = %args.dataset_name,
        total_samples = args.total_samples as u64,
        batch_size = args.batch_size as u64,
        world_size = args.world_size as u64,
        launcher = ?args.launcher,
        mode = ?args.mode,
        device = %cfg.device,
        sync_gather = cfg.sync_gather,
    )
    .entered();

    let start = Instant::now();
    let outcome = match args.launcher {
        Launcher::Threads => run_threads(&args, &cfg)?,
        Launcher::Tcp => run_tcp(&args, &cfg)?,
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Some(Outcome::MeanScore(score)) => {
            info!(elapsed_ms, mean_score = score, "demo complete");
        }
        Some(Outcome::ListenerLoss(loss)) => {
            info!(elapsed_ms, listener_loss = f64::from(loss), "demo complete");
        }
        None => info!(elapsed_ms, "worker done"),
    }
    Ok(())
}
