//! Durable snapshot of the aggregation state between windows.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tb_core::{BalanceMap, PipelineError, RetryPolicy, WindowIndex};
use tb_source::SourceCursor;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Run parameters a checkpoint is only valid for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub ledger: String,
    pub start_date: NaiveDate,
    pub period_days: u32,
    pub top_k: usize,
    pub keep_ids: bool,
    pub decimals: u32,
}

/// Borrowed form written by [`CheckpointStore::save`]. Built at a quiescent
/// point, so the balance map is never serialized while it is being mutated.
#[derive(Debug, Serialize)]
pub struct CheckpointView<'a> {
    pub version: u32,
    pub meta: &'a CheckpointMeta,
    pub next_window: WindowIndex,
    pub table_columns: usize,
    pub sources: &'a BTreeMap<String, Option<SourceCursor>>,
    pub balances: &'a BalanceMap,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub version: u32,
    pub meta: CheckpointMeta,
    pub next_window: WindowIndex,
    pub table_columns: usize,
    pub sources: BTreeMap<String, Option<SourceCursor>>,
    pub balances: BalanceMap,
}

impl Checkpoint {
    pub fn view(&self) -> CheckpointView<'_> {
        CheckpointView {
            version: self.version,
            meta: &self.meta,
            next_window: self.next_window,
            table_columns: self.table_columns,
            sources: &self.sources,
            balances: &self.balances,
        }
    }
}

pub struct CheckpointStore {
    path: PathBuf,
    retry: RetryPolicy,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            path: path.into(),
            retry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces any previous checkpoint. The old file stays in place until the
    /// new one has been written and synced.
    pub fn save(&self, view: &CheckpointView<'_>) -> Result<(), PipelineError> {
        self.retry
            .run(|attempt| {
                if attempt > 0 {
                    debug!(path = %self.path.display(), attempt, "retrying checkpoint save");
                }
                self.write_once(view)
            })
            .map_err(|source| PipelineError::Persist {
                target: self.path.clone(),
                source,
            })?;
        info!(
            path = %self.path.display(),
            next_window = view.next_window,
            entries = view.balances.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    fn write_once(&self, view: &CheckpointView<'_>) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, view)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Takes the checkpoint left by an earlier run, if there is one.
    ///
    /// A file that cannot be read or parsed is reported and left alone. A
    /// parsed checkpoint is removed from disk: it is consumed by this run.
    pub fn load(&self) -> Result<Option<Checkpoint>, PipelineError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(PipelineError::CheckpointCorrupt {
                    path: self.path.clone(),
                    reason: err.to_string(),
                })
            }
        };
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|err| PipelineError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(PipelineError::CheckpointCorrupt {
                path: self.path.clone(),
                reason: format!(
                    "version {} is not supported (expected {CHECKPOINT_VERSION})",
                    checkpoint.version
                ),
            });
        }

        self.discard()?;
        info!(
            path = %self.path.display(),
            next_window = checkpoint.next_window,
            entries = checkpoint.balances.len(),
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    pub fn discard(&self) -> Result<(), PipelineError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "could not remove checkpoint");
                Err(PipelineError::io(
                    format!("removing {}", self.path.display()),
                    err,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> CheckpointMeta {
        CheckpointMeta {
            ledger: "bitcoin".into(),
            start_date: NaiveDate::from_ymd_opt(2022, 1, 2).unwrap(),
            period_days: 7,
            top_k: 10,
            keep_ids: false,
            decimals: 8,
        }
    }

    fn sources() -> BTreeMap<String, Option<SourceCursor>> {
        let mut sources = BTreeMap::new();
        sources.insert(
            "credits".to_string(),
            Some(SourceCursor {
                file: "c_000.csv".into(),
                byte: 120,
                line: 4,
                record: 3,
                finished: false,
                last_date: NaiveDate::from_ymd_opt(2022, 1, 5),
            }),
        );
        sources.insert("debits".to_string(), None);
        sources
    }

    #[test]
    fn save_then_load_restores_state_and_consumes_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path().join("cp.json"), RetryPolicy::once());
        let meta = meta();
        let sources = sources();
        let balances: BalanceMap = [("A".to_string(), 70), ("B".to_string(), i128::MAX)]
            .into_iter()
            .collect();

        store
            .save(&CheckpointView {
                version: CHECKPOINT_VERSION,
                meta: &meta,
                next_window: 2,
                table_columns: 2,
                sources: &sources,
                balances: &balances,
            })
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.next_window, 2);
        assert_eq!(loaded.sources, sources);
        assert_eq!(loaded.balances, balances);
        assert!(!store.path().exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn saving_replaces_the_previous_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path().join("cp.json"), RetryPolicy::once());
        let meta = meta();
        let sources = sources();
        let mut balances = BalanceMap::new();
        for window in 0..3 {
            balances.add("A".into(), 1);
            store
                .save(&CheckpointView {
                    version: CHECKPOINT_VERSION,
                    meta: &meta,
                    next_window: window + 1,
                    table_columns: window as usize + 1,
                    sources: &sources,
                    balances: &balances,
                })
                .unwrap();
        }
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.next_window, 3);
        assert_eq!(loaded.balances.get("A"), Some(3));

        // load consumed the checkpoint and no temp files were left behind
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn corrupt_checkpoint_is_reported_and_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cp.json");
        fs::write(&path, "{\"version\":1,\"meta\":").unwrap();
        let store = CheckpointStore::new(&path, RetryPolicy::once());

        let err = store.load().unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointCorrupt { .. }));
        assert!(path.exists());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path().join("cp.json"), RetryPolicy::once());
        let meta = meta();
        let sources = BTreeMap::new();
        let balances = BalanceMap::new();
        store
            .save(&CheckpointView {
                version: CHECKPOINT_VERSION + 1,
                meta: &meta,
                next_window: 0,
                table_columns: 0,
                sources: &sources,
                balances: &balances,
            })
            .unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            PipelineError::CheckpointCorrupt { .. }
        ));
    }

    #[test]
    fn absent_checkpoint_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path().join("missing.json"), RetryPolicy::once());
        assert!(store.load().unwrap().is_none());
    }
}
