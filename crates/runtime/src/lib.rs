//! Runtime for the top-balances pipeline: checkpointing, cancellation, metrics
//! and the window-by-window driver.

use tracing_subscriber::EnvFilter;

pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod pipeline;

pub use cancel::CancellationToken;
pub use checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore, CheckpointView};
pub use config::PipelineConfig;
pub use pipeline::{Pipeline, RunOutcome, RunStatus};

/// `RUST_LOG` wins; otherwise `info`, or `debug` for verbose runs.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
