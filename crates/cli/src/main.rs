use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tb_core::{PipelineError, MAX_DECIMALS};
use tb_runtime::{init_tracing, CancellationToken, Pipeline, PipelineConfig, RunStatus};
use tracing::{info, warn};

const EXIT_CANCELLED: u8 = 3;

/// Weekly top-K balance table for a ledger of per-sub-ledger CSV transfer logs.
#[derive(Debug, Parser)]
#[command(name = "top_balances", version)]
struct Args {
    /// Directory that holds the ledger folders
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Ledger folder name; names starting with "eth" use 18 decimals, others 8
    #[arg(long)]
    name: String,

    /// First window ends one period after this date (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    start_date: Option<NaiveDate>,

    /// Last date to aggregate (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,

    #[arg(long, default_value_t = 10_000)]
    top: usize,

    /// Drop zero balances every N windows
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    prune_every: u32,

    #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(u32).range(1..))]
    period_days: u32,

    /// Write the address next to every balance
    #[arg(long)]
    keep_addresses: bool,

    /// Delete input files once their records are safely aggregated
    #[arg(long = "rm")]
    remove_consumed: bool,

    /// Override the ledger's decimal places
    #[arg(long, value_parser = clap::value_parser!(u32).range(..=i64::from(MAX_DECIMALS)))]
    decimals: Option<u32>,

    /// Pad sub-ledgers that run out of records with empty windows
    #[arg(long)]
    allow_incomplete: bool,

    #[arg(long)]
    no_final_checkpoint: bool,

    /// Rebuild the output table even though no checkpoint exists for it
    #[arg(long)]
    fresh: bool,

    #[arg(long)]
    parallel_reads: bool,

    /// Stop after this many windows, leaving a checkpoint to resume from
    #[arg(long)]
    max_windows: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        PipelineConfig {
            start_date: self.start_date,
            end_date: self.end_date,
            period_days: self.period_days,
            top_k: self.top,
            prune_every: self.prune_every,
            keep_ids: self.keep_addresses,
            remove_consumed: self.remove_consumed,
            decimals: self.decimals,
            allow_incomplete: self.allow_incomplete,
            final_checkpoint: !self.no_final_checkpoint,
            fresh: self.fresh,
            parallel_reads: self.parallel_reads,
            max_windows: self.max_windows,
            ..PipelineConfig::new(self.dir, self.name)
        }
    }
}

fn parse_date(text: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let result = run(args);
    if let Err(err) = &result {
        match err.downcast_ref::<PipelineError>() {
            Some(pipeline_err) => eprintln!("error[{}]: {pipeline_err}", pipeline_err.kind()),
            None => eprintln!("error: {err:#}"),
        }
    }
    ExitCode::from(exit_status(&result))
}

/// 0 completed, 3 cancelled, 1 on any error.
fn exit_status(result: &Result<RunStatus>) -> u8 {
    match result {
        Ok(RunStatus::Completed) => 0,
        Ok(RunStatus::Cancelled) => EXIT_CANCELLED,
        Err(_) => 1,
    }
}

fn run(args: Args) -> Result<RunStatus> {
    let cancel = CancellationToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        if !handler.is_cancelled() {
            warn!("interrupt received, stopping after the current window");
        }
        handler.cancel();
    })
    .context("failed to install interrupt handler")?;

    let pipeline = Pipeline::new(args.into_config(), cancel);
    let outcome = pipeline.run()?;
    info!(
        status = ?outcome.status,
        windows = outcome.windows_processed,
        output = %outcome.output.display(),
        "done"
    );
    Ok(outcome.status)
}
