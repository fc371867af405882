//! Running balance aggregation with amortized zero-pruning.

use serde::{Deserialize, Serialize};
use tb_core::{BalanceMap, PipelineError, WindowIndex};
use tb_source::WindowBatch;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Zero balances are dropped after every window whose index is a multiple of this.
    pub prune_every: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { prune_every: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceReport {
    pub window: WindowIndex,
    pub records: usize,
    pub pruned: usize,
    pub entries: usize,
}

/// Owns the live [`BalanceMap`] and applies window batches strictly in order.
///
/// Pruning cadence only trades memory against CPU: balances and every top-K
/// snapshot come out the same for any `prune_every`.
pub struct Aggregator {
    cfg: AggregatorConfig,
    balances: BalanceMap,
    next_window: WindowIndex,
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self::resume(cfg, BalanceMap::new(), 0)
    }

    pub fn resume(cfg: AggregatorConfig, balances: BalanceMap, next_window: WindowIndex) -> Self {
        let cfg = AggregatorConfig {
            prune_every: cfg.prune_every.max(1),
        };
        Self {
            cfg,
            balances,
            next_window,
        }
    }

    /// Applies every source's batch for `window`, one batch at a time.
    ///
    /// Nothing is mutated when the window or any batch is out of order.
    pub fn advance(
        &mut self,
        window: WindowIndex,
        batches: Vec<WindowBatch>,
    ) -> Result<AdvanceReport, PipelineError> {
        if window != self.next_window {
            return Err(PipelineError::OrderingViolation {
                expected: self.next_window,
                got: window,
            });
        }
        if let Some(stray) = batches.iter().find(|b| b.window != window) {
            return Err(PipelineError::OrderingViolation {
                expected: window,
                got: stray.window,
            });
        }

        let mut records = 0;
        for batch in batches {
            records += batch.entries.len();
            for (entity, amount) in batch.entries {
                self.balances.add(entity, amount);
            }
        }

        let pruned = if window % u64::from(self.cfg.prune_every) == 0 {
            self.balances.retain_non_zero()
        } else {
            0
        };
        self.next_window += 1;

        let report = AdvanceReport {
            window,
            records,
            pruned,
            entries: self.balances.len(),
        };
        debug!(window, records, pruned, entries = report.entries, "window applied");
        Ok(report)
    }

    pub fn balances(&self) -> &BalanceMap {
        &self.balances
    }

    pub fn next_window(&self) -> WindowIndex {
        self.next_window
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.cfg
    }

    pub fn into_balances(self) -> BalanceMap {
        self.balances
    }
}
