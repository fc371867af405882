use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tb_core::{LedgerFamily, RetryPolicy};
use tb_source::ColumnNames;

/// Everything one pipeline run needs to know.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding one folder per ledger.
    pub root: PathBuf,
    pub ledger: String,
    /// First window ends `period_days` after this date. Derived from the data when unset.
    pub start_date: Option<NaiveDate>,
    /// Last date to aggregate. Without it the run goes until every sub-ledger is exhausted.
    pub end_date: Option<NaiveDate>,
    pub period_days: u32,
    pub top_k: usize,
    pub prune_every: u32,
    pub keep_ids: bool,
    pub remove_consumed: bool,
    /// Overrides the decimal places implied by the ledger name.
    pub decimals: Option<u32>,
    pub allow_incomplete: bool,
    pub final_checkpoint: bool,
    /// Start over even though an output table without a checkpoint is present.
    pub fresh: bool,
    pub parallel_reads: bool,
    /// Stop after this many windows, as if cancelled.
    pub max_windows: Option<u64>,
    pub columns: ColumnNames,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            ledger: String::new(),
            start_date: None,
            end_date: None,
            period_days: 7,
            top_k: 10_000,
            prune_every: 10,
            keep_ids: false,
            remove_consumed: false,
            decimals: None,
            allow_incomplete: false,
            final_checkpoint: true,
            fresh: false,
            parallel_reads: false,
            max_windows: None,
            columns: ColumnNames::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(root: impl Into<PathBuf>, ledger: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ledger: ledger.into(),
            ..Self::default()
        }
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join(&self.ledger)
    }

    pub fn output_path(&self) -> PathBuf {
        self.ledger_dir().join(format!("top{}_balances.csv", self.top_k))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.ledger_dir()
            .join(format!("top{}_balances.checkpoint.json", self.top_k))
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
            .unwrap_or_else(|| LedgerFamily::from_ledger_name(&self.ledger).decimals())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_paths_and_decimals_from_the_ledger() {
        let mut cfg = PipelineConfig::new("/data", "ethereum");
        cfg.top_k = 500;
        assert_eq!(cfg.output_path(), PathBuf::from("/data/ethereum/top500_balances.csv"));
        assert_eq!(
            cfg.checkpoint_path(),
            PathBuf::from("/data/ethereum/top500_balances.checkpoint.json")
        );
        assert_eq!(cfg.decimals(), 18);

        let btc = PipelineConfig::new("/data", "bitcoin");
        assert_eq!(btc.decimals(), 8);
        let overridden = PipelineConfig {
            decimals: Some(2),
            ..btc
        };
        assert_eq!(overridden.decimals(), 2);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"root":"/data","ledger":"bitcoin","top_k":3}"#).unwrap();
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.period_days, 7);
        assert!(cfg.final_checkpoint);
        assert_eq!(cfg.columns, ColumnNames::default());
    }
}
