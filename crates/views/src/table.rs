//! The weekly top-K table: one column per window, one row per rank.
//!
//! On disk the table is CSV. The first column is `rank` (0-based); every window
//! adds a `<date>` column, preceded by `<date>_address` when identifiers are
//! kept. Values are scaled by the ledger's decimal places when written and
//! parsed back to raw integer amounts when loaded, so resuming never scales a
//! value twice.

use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tb_core::{
    format_scaled, parse_scaled, Amount, EntityId, PipelineError, RetryPolicy, WindowClock, WindowIndex, MAX_DECIMALS,
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::TopK;

pub const RANK_HEADER: &str = "rank";
pub const ADDRESS_SUFFIX: &str = "_address";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub label: String,
    pub values: Vec<Amount>,
    pub ids: Option<Vec<EntityId>>,
}

/// Append-only, in-memory table of raw amounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputTable {
    columns: Vec<Column>,
}

impl OutputTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the snapshot of the next window. Labels must strictly increase.
    pub fn append_column(&mut self, label: impl Into<String>, top: TopK) -> Result<(), PipelineError> {
        let label = label.into();
        if let Some(previous) = self.columns.last() {
            if label <= previous.label {
                return Err(PipelineError::ColumnOrder {
                    previous: previous.label.clone(),
                    label,
                });
            }
        }
        self.columns.push(Column {
            label,
            values: top.values,
            ids: top.ids,
        });
        Ok(())
    }

    /// Adds the snapshot of `window`, labelled by `clock`. `window` must be the
    /// next column of the table.
    pub fn append_window(&mut self, clock: &WindowClock, window: WindowIndex, top: TopK) -> Result<(), PipelineError> {
        let expected = self.columns.len() as WindowIndex;
        if window != expected {
            return Err(PipelineError::OrderingViolation { expected, got: window });
        }
        let label = clock.label(window);
        if let Some(previous) = self.columns.last() {
            if previous.label != clock.label(window - 1) {
                return Err(PipelineError::ColumnOrder {
                    previous: previous.label.clone(),
                    label,
                });
            }
        }
        self.append_column(label, top)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.label.as_str())
    }

    fn row_count(&self) -> usize {
        self.columns.iter().map(|c| c.values.len()).max().unwrap_or(0)
    }
}

pub struct TableWriter {
    path: PathBuf,
    decimals: u32,
    keep_ids: bool,
    retry: RetryPolicy,
}

impl TableWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        decimals: u32,
        keep_ids: bool,
        retry: RetryPolicy,
    ) -> Result<Self, PipelineError> {
        if decimals > MAX_DECIMALS {
            return Err(PipelineError::InvalidConfig(format!(
                "{decimals} decimal places requested, at most {MAX_DECIMALS} are supported"
            )));
        }
        Ok(Self {
            path: path.into(),
            decimals,
            keep_ids,
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Loads a table left by an earlier run, or an empty one if there is none.
    pub fn load_or_empty(&self) -> Result<OutputTable, PipelineError> {
        if !self.exists() {
            return Ok(OutputTable::new());
        }
        let context = self.path.display().to_string();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)
            .map_err(|err| PipelineError::csv(context.clone(), err))?;
        let headers = reader
            .headers()
            .map_err(|err| PipelineError::csv(context.clone(), err))?
            .clone();

        let layout = self.parse_layout(&headers)?;
        let mut columns: Vec<Column> = layout
            .iter()
            .map(|slot| Column {
                label: slot.label.clone(),
                values: Vec::new(),
                ids: slot.id_field.map(|_| Vec::new()),
            })
            .collect();

        for row in reader.records() {
            let row = row.map_err(|err| PipelineError::csv(context.clone(), err))?;
            let line = row.position().map_or(0, |p| p.line());
            for (slot, column) in layout.iter().zip(columns.iter_mut()) {
                let text = row.get(slot.value_field).unwrap_or("").trim();
                if text.is_empty() {
                    continue;
                }
                let value = parse_scaled(text, self.decimals).ok_or_else(|| PipelineError::MalformedRecord {
                    location: format!("{context}:{line}"),
                    reason: format!("value {text:?} does not fit {} decimal places", self.decimals),
                })?;
                column.values.push(value);
                if let (Some(field), Some(ids)) = (slot.id_field, column.ids.as_mut()) {
                    ids.push(row.get(field).unwrap_or("").trim().to_string());
                }
            }
        }

        let mut table = OutputTable::new();
        for column in columns {
            let top = TopK {
                values: column.values,
                ids: column.ids,
            };
            table.append_column(column.label, top)?;
        }
        info!(path = %self.path.display(), columns = table.column_count(), "loaded partial output table");
        Ok(table)
    }

    fn parse_layout(&self, headers: &csv::StringRecord) -> Result<Vec<Slot>, PipelineError> {
        let mut fields = headers.iter().enumerate().skip(1);
        let has_ids = headers.iter().any(|h| h.ends_with(ADDRESS_SUFFIX));
        if headers.len() > 1 && has_ids != self.keep_ids {
            return Err(PipelineError::CheckpointConsistency(format!(
                "{} {} address columns but this run {} them",
                self.path.display(),
                if has_ids { "has" } else { "lacks" },
                if self.keep_ids { "keeps" } else { "drops" },
            )));
        }

        let mut slots = Vec::new();
        while let Some((idx, header)) = fields.next() {
            let slot = match header.strip_suffix(ADDRESS_SUFFIX) {
                Some(label) => match fields.next() {
                    Some((value_idx, value_header)) if value_header == label => Slot {
                        label: label.to_string(),
                        value_field: value_idx,
                        id_field: Some(idx),
                    },
                    _ => {
                        return Err(PipelineError::CheckpointConsistency(format!(
                            "{}: address column {header} has no matching value column",
                            self.path.display()
                        )))
                    }
                },
                None => Slot {
                    label: header.to_string(),
                    value_field: idx,
                    id_field: None,
                },
            };
            slots.push(slot);
        }
        Ok(slots)
    }

    /// Rewrites the whole table, replacing the previous file atomically.
    pub fn flush(&self, table: &OutputTable) -> Result<(), PipelineError> {
        self.retry
            .run(|attempt| {
                if attempt > 0 {
                    debug!(path = %self.path.display(), attempt, "retrying table flush");
                }
                self.write_once(table)
            })
            .map_err(|source| PipelineError::Persist {
                target: self.path.clone(),
                source,
            })?;
        info!(path = %self.path.display(), columns = table.column_count(), "output table written");
        Ok(())
    }

    fn write_once(&self, table: &OutputTable) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = csv::Writer::from_writer(BufWriter::new(tmp.as_file()));

            let mut header = vec![RANK_HEADER.to_string()];
            for column in table.columns() {
                if column.ids.is_some() {
                    header.push(format!("{}{ADDRESS_SUFFIX}", column.label));
                }
                header.push(column.label.clone());
            }
            writer.write_record(&header)?;

            let mut row = Vec::with_capacity(header.len());
            for rank in 0..table.row_count() {
                row.clear();
                row.push(rank.to_string());
                for column in table.columns() {
                    if let Some(ids) = &column.ids {
                        row.push(ids.get(rank).cloned().unwrap_or_default());
                    }
                    let value = match column.values.get(rank) {
                        Some(v) => format_scaled(*v, self.decimals).ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidInput, "decimal places out of range")
                        })?,
                        None => String::new(),
                    };
                    row.push(value);
                }
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

struct Slot {
    label: String,
    value_field: usize,
    id_field: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top(values: &[i128], ids: Option<&[&str]>) -> TopK {
        TopK {
            values: values.to_vec(),
            ids: ids.map(|ids| ids.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn appended_labels_must_increase() {
        let mut table = OutputTable::new();
        table.append_column("2022-01-09", top(&[1], None)).unwrap();
        let err = table.append_column("2022-01-09", top(&[1], None)).unwrap_err();
        assert!(matches!(err, PipelineError::ColumnOrder { .. }));
    }

    #[test]
    fn flush_writes_scaled_values_with_ragged_columns() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("top2_balances.csv");
        let writer = TableWriter::new(&path, 8, false, RetryPolicy::once()).unwrap();

        let mut table = OutputTable::new();
        table.append_column("2022-01-09", top(&[10_000_000_000, 5_000_000_000], None)).unwrap();
        table.append_column("2022-01-16", top(&[7_000_000_000], None)).unwrap();
        writer.flush(&table).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "rank,2022-01-09,2022-01-16\n0,100,70\n1,50,\n");
    }

    #[test]
    fn reload_does_not_rescale_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.csv");
        let writer = TableWriter::new(&path, 18, true, RetryPolicy::once()).unwrap();

        let mut table = OutputTable::new();
        table
            .append_column("2022-01-09", top(&[1_500_000_000_000_000_000, 1], Some(&["0xa", "0xb"])))
            .unwrap();
        writer.flush(&table).unwrap();

        let once = writer.load_or_empty().unwrap();
        assert_eq!(once, table);
        writer.flush(&once).unwrap();
        let twice = writer.load_or_empty().unwrap();
        assert_eq!(twice, table);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("rank,2022-01-09_address,2022-01-09\n0,0xa,1.5\n"));
    }

    #[test]
    fn id_layout_must_match_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.csv");
        let with_ids = TableWriter::new(&path, 8, true, RetryPolicy::once()).unwrap();
        let mut table = OutputTable::new();
        table.append_column("2022-01-09", top(&[1], Some(&["a"]))).unwrap();
        with_ids.flush(&table).unwrap();

        let without_ids = TableWriter::new(&path, 8, false, RetryPolicy::once()).unwrap();
        let err = without_ids.load_or_empty().unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointConsistency(_)));
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = TableWriter::new(tmp.path().join("none.csv"), 8, false, RetryPolicy::once()).unwrap();
        assert_eq!(writer.load_or_empty().unwrap().column_count(), 0);
    }

    #[test]
    fn unsupported_decimal_places_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("table.csv");
        assert!(TableWriter::new(&path, MAX_DECIMALS, false, RetryPolicy::once()).is_ok());
        let err = TableWriter::new(&path, 36, false, RetryPolicy::once()).err().unwrap();
        assert_eq!(err.kind(), "InvalidConfig");
    }

    #[test]
    fn window_columns_follow_the_clock() {
        let clock = WindowClock::weekly(chrono::NaiveDate::from_ymd_opt(2022, 1, 2).unwrap());
        let mut table = OutputTable::new();
        table.append_window(&clock, 0, top(&[1], None)).unwrap();
        assert_eq!(table.labels().collect::<Vec<_>>(), ["2022-01-09"]);

        let err = table.append_window(&clock, 2, top(&[1], None)).unwrap_err();
        assert!(matches!(err, PipelineError::OrderingViolation { expected: 1, got: 2 }));

        // a column that is later than its index but not on the clock
        let mut skewed = OutputTable::new();
        skewed.append_column("2022-01-10", top(&[1], None)).unwrap();
        let err = skewed.append_window(&clock, 1, top(&[1], None)).unwrap_err();
        assert!(matches!(err, PipelineError::ColumnOrder { .. }));

        table.append_window(&clock, 1, top(&[2], None)).unwrap();
        assert_eq!(table.labels().collect::<Vec<_>>(), ["2022-01-09", "2022-01-16"]);
    }
}
