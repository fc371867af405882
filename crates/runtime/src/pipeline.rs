//! The window-by-window driver.
//!
//! One run moves through `init`, `loading_checkpoint` and `processing`, then
//! ends in either `checkpointing` (cancelled or window limit reached) or
//! `finalizing` (sources exhausted or end date reached). Each transition is
//! logged with a `stage` field.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, Weekday};
use rayon::prelude::*;
use tb_aggregator::{Aggregator, AggregatorConfig};
use tb_core::{aligned_start, BalanceMap, PipelineError, WindowClock, WindowIndex};
use tb_source::{
    discover_sub_ledgers, first_record_date, CsvLedgerSource, RecordSource, SourceCursor, SubLedger,
    WindowBatch, WindowSplitter,
};
use tb_views::{OutputTable, TableWriter, TopKConfig};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::checkpoint::{Checkpoint, CheckpointMeta, CheckpointStore, CheckpointView, CHECKPOINT_VERSION};
use crate::config::PipelineConfig;
use crate::metrics::{MetricsRegistry, MetricsSnapshot, RunTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Stopped at a window boundary; a checkpoint was written.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Windows processed by this run, not counting resumed ones.
    pub windows_processed: u64,
    pub next_window: WindowIndex,
    pub output: PathBuf,
    pub metrics: MetricsSnapshot,
}

pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
    metrics: MetricsRegistry,
}

struct Prepared {
    meta: CheckpointMeta,
    clock: WindowClock,
    table: OutputTable,
    splitters: Vec<WindowSplitter<CsvLedgerSource>>,
    last_window: Option<WindowIndex>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            metrics: MetricsRegistry::default(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn run(&self) -> Result<RunOutcome, PipelineError> {
        let timer = RunTimer::start();
        let cfg = &self.config;
        info!(stage = "init", ledger = %cfg.ledger, dir = %cfg.ledger_dir().display(), "starting run");

        let subs = discover_sub_ledgers(&cfg.ledger_dir())?;
        let store = CheckpointStore::new(cfg.checkpoint_path(), cfg.retry.clone());
        let writer = TableWriter::new(cfg.output_path(), cfg.decimals(), cfg.keep_ids, cfg.retry.clone())?;

        info!(stage = "loading_checkpoint", path = %store.path().display(), "looking for a checkpoint");
        let checkpoint = store.load()?;
        let prepared = match self.prepare(&subs, &writer, checkpoint.as_ref()) {
            Ok(prepared) => prepared,
            Err(err) => {
                // the checkpoint was consumed by load; put it back untouched
                if let Some(cp) = &checkpoint {
                    match store.save(&cp.view()) {
                        Ok(()) => warn!(path = %store.path().display(), "checkpoint restored after failed resume"),
                        Err(save_err) => error!(%save_err, "could not restore the loaded checkpoint"),
                    }
                }
                return Err(err);
            }
        };

        let resumed = checkpoint.is_some();
        let (balances, next_window) = match checkpoint {
            Some(cp) => (cp.balances, cp.next_window),
            None => (BalanceMap::new(), 0),
        };
        let aggregator = Aggregator::resume(
            AggregatorConfig {
                prune_every: cfg.prune_every,
            },
            balances,
            next_window,
        );

        let mut session = Session {
            config: cfg,
            metrics: &self.metrics,
            store: &store,
            writer: &writer,
            meta: prepared.meta,
            clock: prepared.clock,
            topk: TopKConfig {
                k: cfg.top_k,
                with_ids: cfg.keep_ids,
            },
            splitters: prepared.splitters,
            aggregator,
            table: prepared.table,
            last_window: prepared.last_window,
            quiescent: BTreeMap::new(),
            consumed: Vec::new(),
            processed: 0,
            resumed,
        };

        let status = match session.process(&self.cancel) {
            Ok(status) => status,
            Err(err) => {
                error!(stage = "failed", kind = err.kind(), %err, "run aborted");
                if !err.is_persistence() {
                    session.save_progress();
                }
                return Err(err);
            }
        };
        session.remove_consumed();

        let metrics = self.metrics.snapshot();
        info!(
            stage = "terminated",
            status = ?status,
            windows = session.processed,
            next_window = session.aggregator.next_window(),
            "{}",
            metrics.to_json_line("run", Some(timer.elapsed()))
        );
        Ok(RunOutcome {
            status,
            windows_processed: session.processed,
            next_window: session.aggregator.next_window(),
            output: writer.path().to_path_buf(),
            metrics,
        })
    }

    fn prepare(
        &self,
        subs: &[SubLedger],
        writer: &TableWriter,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<Prepared, PipelineError> {
        let cfg = &self.config;
        let start_date = match (cfg.start_date, checkpoint) {
            (Some(date), _) => date,
            (None, Some(cp)) => cp.meta.start_date,
            (None, None) => self.derive_start(subs)?,
        };
        let clock = WindowClock::new(start_date, cfg.period_days);
        let meta = CheckpointMeta {
            ledger: cfg.ledger.clone(),
            start_date,
            period_days: clock.period_days(),
            top_k: cfg.top_k,
            keep_ids: cfg.keep_ids,
            decimals: cfg.decimals(),
        };

        let table = match checkpoint {
            Some(cp) => {
                let table = writer.load_or_empty()?;
                validate_resume(cp, &meta, &clock, &table, subs)?;
                table
            }
            None if cfg.fresh => {
                if writer.exists() {
                    warn!(path = %writer.path().display(), "fresh run replaces the existing output table");
                }
                OutputTable::new()
            }
            None => {
                let table = writer.load_or_empty()?;
                if table.column_count() > 0 {
                    return Err(PipelineError::CheckpointConsistency(format!(
                        "{} already holds {} columns but there is no checkpoint to resume from; rerun with --fresh to rebuild it",
                        writer.path().display(),
                        table.column_count()
                    )));
                }
                table
            }
        };

        let first_window = checkpoint.map_or(0, |cp| cp.next_window);
        let last_window = cfg
            .end_date
            .map(|end| clock.windows_until(end).saturating_sub(1));

        let mut splitters = Vec::with_capacity(subs.len());
        for sub in subs {
            let cursor = checkpoint
                .and_then(|cp| cp.sources.get(&sub.name))
                .and_then(Option::as_ref);
            let source = CsvLedgerSource::open(&sub.name, &sub.dir, cfg.columns.clone(), cursor)?;
            splitters.push(WindowSplitter::new(
                source,
                clock,
                first_window,
                last_window,
                cfg.allow_incomplete,
            ));
        }

        Ok(Prepared {
            meta,
            clock,
            table,
            splitters,
            last_window,
        })
    }

    /// First boundary-aligned date after the earliest record of any sub-ledger.
    fn derive_start(&self, subs: &[SubLedger]) -> Result<NaiveDate, PipelineError> {
        let mut first: Option<NaiveDate> = None;
        for sub in subs {
            if let Some(date) = first_record_date(sub, &self.config.columns)? {
                first = Some(first.map_or(date, |current| current.min(date)));
            }
        }
        let first = first.ok_or_else(|| {
            PipelineError::SourceMissing(format!(
                "no records under {}",
                self.config.ledger_dir().display()
            ))
        })?;
        let anchor = self.config.end_date.map_or(Weekday::Sun, |end| end.weekday());
        let start = aligned_start(first, anchor);
        info!(%first, %start, "derived start date");
        Ok(start)
    }
}

fn validate_resume(
    cp: &Checkpoint,
    meta: &CheckpointMeta,
    clock: &WindowClock,
    table: &OutputTable,
    subs: &[SubLedger],
) -> Result<(), PipelineError> {
    if cp.meta != *meta {
        return Err(PipelineError::CheckpointConsistency(format!(
            "checkpoint was written for {:?}, this run uses {:?}",
            cp.meta, meta
        )));
    }
    if cp.next_window != cp.table_columns as u64 || table.column_count() != cp.table_columns {
        return Err(PipelineError::CheckpointConsistency(format!(
            "checkpoint resumes at window {} ({} columns recorded) but the output table has {} columns",
            cp.next_window,
            cp.table_columns,
            table.column_count()
        )));
    }
    for (window, label) in table.labels().enumerate() {
        let expected = clock.label(window as WindowIndex);
        if label != expected {
            return Err(PipelineError::CheckpointConsistency(format!(
                "output column {window} is labelled {label}, expected {expected}"
            )));
        }
    }
    let recorded: BTreeSet<&str> = cp.sources.keys().map(String::as_str).collect();
    let current: BTreeSet<&str> = subs.iter().map(|s| s.name.as_str()).collect();
    if recorded != current {
        return Err(PipelineError::CheckpointConsistency(format!(
            "checkpoint covers sub-ledgers {recorded:?}, found {current:?}"
        )));
    }
    Ok(())
}

/// Live state of one run between `prepare` and termination.
struct Session<'a> {
    config: &'a PipelineConfig,
    metrics: &'a MetricsRegistry,
    store: &'a CheckpointStore,
    writer: &'a TableWriter,
    meta: CheckpointMeta,
    clock: WindowClock,
    topk: TopKConfig,
    splitters: Vec<WindowSplitter<CsvLedgerSource>>,
    aggregator: Aggregator,
    table: OutputTable,
    last_window: Option<WindowIndex>,
    /// Source cursors taken before the window in progress started.
    quiescent: BTreeMap<String, Option<SourceCursor>>,
    consumed: Vec<PathBuf>,
    processed: u64,
    resumed: bool,
}

impl Session<'_> {
    fn process(&mut self, cancel: &CancellationToken) -> Result<RunStatus, PipelineError> {
        info!(
            stage = "processing",
            first_window = self.aggregator.next_window(),
            last_window = ?self.last_window,
            sources = self.splitters.len(),
            "processing windows"
        );
        loop {
            self.quiescent = self.cursors();
            let window = self.aggregator.next_window();
            if self.last_window.is_some_and(|last| window > last) {
                break;
            }
            if cancel.is_cancelled() {
                info!(stage = "checkpointing", window, "cancellation requested");
                return self.stop_early();
            }
            if self.config.max_windows.is_some_and(|max| self.processed >= max) {
                info!(stage = "checkpointing", window, processed = self.processed, "window limit reached");
                return self.stop_early();
            }

            let Some(batches) = self.read_window(window)? else {
                break;
            };
            self.apply(window, batches)?;
        }

        self.collect_consumed();
        info!(stage = "finalizing", next_window = self.aggregator.next_window(), "sources exhausted");
        for splitter in &self.splitters {
            splitter.check_conservation()?;
        }
        if self.table.column_count() as u64 != self.aggregator.next_window() {
            return Err(PipelineError::CheckpointConsistency(format!(
                "output table has {} columns after {} windows",
                self.table.column_count(),
                self.aggregator.next_window()
            )));
        }
        let sources = self.cursors();
        self.persist(sources, self.config.final_checkpoint)?;
        Ok(RunStatus::Completed)
    }

    fn stop_early(&mut self) -> Result<RunStatus, PipelineError> {
        let sources = self.cursors();
        self.persist(sources, true)?;
        Ok(RunStatus::Cancelled)
    }

    /// One batch per sub-ledger, or `None` once every sub-ledger is done.
    fn read_window(&mut self, window: WindowIndex) -> Result<Option<Vec<WindowBatch>>, PipelineError> {
        let batches: Vec<Option<WindowBatch>> = if self.config.parallel_reads {
            self.splitters
                .par_iter_mut()
                .map(|splitter| splitter.next_batch())
                .collect::<Result<_, _>>()?
        } else {
            self.splitters
                .iter_mut()
                .map(|splitter| splitter.next_batch())
                .collect::<Result<_, _>>()?
        };

        let exhausted: Vec<String> = self
            .splitters
            .iter()
            .zip(&batches)
            .filter(|(_, batch)| batch.is_none())
            .map(|(splitter, _)| splitter.name().to_string())
            .collect();
        if exhausted.len() == batches.len() {
            return Ok(None);
        }
        if !exhausted.is_empty() {
            if !self.config.allow_incomplete {
                return Err(PipelineError::SourceCountMismatch(format!(
                    "{} ran out of records before window {window} while other sub-ledgers continue",
                    exhausted.join(", ")
                )));
            }
            debug!(window, exhausted = %exhausted.join(", "), "padding exhausted sub-ledgers");
        }

        Ok(Some(
            batches
                .into_iter()
                .map(|batch| batch.unwrap_or_else(|| WindowBatch::empty(window)))
                .collect(),
        ))
    }

    fn apply(&mut self, window: WindowIndex, batches: Vec<WindowBatch>) -> Result<(), PipelineError> {
        let report = self.aggregator.advance(window, batches)?;
        let top = self.topk.extract(self.aggregator.balances());
        let label = self.clock.label(window);
        info!(
            window,
            label = %label,
            records = report.records,
            entries = report.entries,
            top = top.len(),
            "window done"
        );
        self.table.append_window(&self.clock, window, top)?;

        self.collect_consumed();
        self.processed += 1;
        self.metrics.inc_windows_processed(1);
        self.metrics.inc_records_applied(report.records as u64);
        self.metrics.inc_entries_pruned(report.pruned as u64);
        self.metrics.record_entries_peak(report.entries as u64);
        Ok(())
    }

    fn collect_consumed(&mut self) {
        for splitter in &mut self.splitters {
            self.consumed.extend(splitter.source_mut().take_finished_files());
        }
    }

    fn cursors(&self) -> BTreeMap<String, Option<SourceCursor>> {
        self.splitters
            .iter()
            .map(|splitter| (splitter.name().to_string(), splitter.cursor()))
            .collect()
    }

    /// Flushes the table, then writes the checkpoint.
    fn persist(
        &mut self,
        sources: BTreeMap<String, Option<SourceCursor>>,
        save_checkpoint: bool,
    ) -> Result<(), PipelineError> {
        self.writer.flush(&self.table)?;
        if save_checkpoint {
            let view = CheckpointView {
                version: CHECKPOINT_VERSION,
                meta: &self.meta,
                next_window: self.aggregator.next_window(),
                table_columns: self.table.column_count(),
                sources: &sources,
                balances: self.aggregator.balances(),
            };
            self.store.save(&view)?;
            self.metrics.inc_checkpoints_written(1);
        }
        Ok(())
    }

    /// Best-effort save of the last quiescent state after a failure.
    fn save_progress(&mut self) {
        if self.processed == 0 && !self.resumed {
            debug!("nothing processed yet, no checkpoint to save");
            return;
        }
        if self.table.column_count() as u64 != self.aggregator.next_window() {
            warn!(
                columns = self.table.column_count(),
                next_window = self.aggregator.next_window(),
                "failure inside a window; progress cannot be saved consistently"
            );
            return;
        }
        let sources = std::mem::take(&mut self.quiescent);
        match self.persist(sources, true) {
            Ok(()) => info!(
                stage = "checkpointing",
                next_window = self.aggregator.next_window(),
                "progress saved before aborting"
            ),
            Err(err) => error!(%err, "best-effort checkpoint failed"),
        }
    }

    /// Deletes fully read input files. Only called once the state that no
    /// longer needs them has been persisted.
    fn remove_consumed(&mut self) {
        if !self.config.remove_consumed {
            return;
        }
        for path in self.consumed.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => info!(file = %path.display(), "removed consumed input"),
                Err(err) => warn!(file = %path.display(), %err, "could not remove consumed input"),
            }
        }
    }
}
