use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `SGEVAL_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for sgeval workers:
/// - Always include `rank` and `world_size` on events emitted by a worker.
/// - Include `dataset` on run-level events (start, totals).
/// - Include `sample_id` on warnings about a specific sample (the first missing id on gaps).
/// - Summary lines go to target `sgeval_inference`, counters to `sgeval_metrics`.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SGEVAL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
