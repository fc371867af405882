//! Record sources and the window splitter.

use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tb_core::{PipelineError, Record};

pub mod csv_source;
pub mod splitter;

pub use csv_source::{discover_sub_ledgers, first_record_date, CsvLedgerSource, SubLedger};
pub use splitter::{WindowBatch, WindowSplitter};

/// Resume position inside one source: the start of the first record that has
/// not been handed to the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCursor {
    pub file: String,
    pub byte: u64,
    pub line: u64,
    pub record: u64,
    /// `file` has been read to the end; resuming continues with the next file.
    pub finished: bool,
    /// Date of the last record handed out before this position. A resumed
    /// source rejects anything older.
    #[serde(default)]
    pub last_date: Option<NaiveDate>,
}

/// Header names of the three columns a transfer log must carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnNames {
    pub entity: String,
    pub amount: String,
    pub date: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            entity: "address".to_string(),
            amount: "value".to_string(),
            date: "block_date".to_string(),
        }
    }
}

/// An ordered, lazily read stream of records for one sub-ledger.
pub trait RecordSource: Send {
    fn name(&self) -> &str;

    fn next_record(&mut self) -> Result<Option<Record>, PipelineError>;

    /// Where a resumed source should start. With `rewind_last`, the record most
    /// recently returned by `next_record` will be read again.
    fn cursor(&self, rewind_last: bool) -> Option<SourceCursor>;

    /// Input files read to the end since the last call.
    fn take_finished_files(&mut self) -> Vec<PathBuf> {
        Vec::new()
    }
}

impl<S: RecordSource + ?Sized> RecordSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn next_record(&mut self) -> Result<Option<Record>, PipelineError> {
        (**self).next_record()
    }

    fn cursor(&self, rewind_last: bool) -> Option<SourceCursor> {
        (**self).cursor(rewind_last)
    }

    fn take_finished_files(&mut self) -> Vec<PathBuf> {
        (**self).take_finished_files()
    }
}

/// In-memory source, used by tests and by callers that already hold records.
#[derive(Debug, Clone)]
pub struct VecSource {
    name: String,
    records: Vec<Record>,
    next: usize,
    last_date: Option<NaiveDate>,
    resumed_after: Option<NaiveDate>,
}

impl VecSource {
    pub fn new(name: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            records,
            next: 0,
            last_date: None,
            resumed_after: None,
        }
    }

    pub fn resume(name: impl Into<String>, records: Vec<Record>, cursor: Option<&SourceCursor>) -> Self {
        let mut source = Self::new(name, records);
        if let Some(cursor) = cursor {
            source.next = (cursor.record as usize).min(source.records.len());
            source.last_date = cursor.last_date;
            source.resumed_after = cursor.last_date;
        }
        source
    }
}

impl RecordSource for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_record(&mut self) -> Result<Option<Record>, PipelineError> {
        let Some(record) = self.records.get(self.next).cloned() else {
            return Ok(None);
        };
        if let Some(previous) = self.last_date {
            if record.date < previous {
                return Err(PipelineError::UnsortedSource {
                    source_name: self.name.clone(),
                    previous,
                    date: record.date,
                });
            }
        }
        self.last_date = Some(record.date);
        self.next += 1;
        Ok(Some(record))
    }

    fn cursor(&self, rewind_last: bool) -> Option<SourceCursor> {
        let record = if rewind_last {
            self.next.saturating_sub(1)
        } else {
            self.next
        };
        let last_date = match record.checked_sub(1) {
            Some(idx) => self.records.get(idx).map(|r| r.date),
            None => self.resumed_after,
        };
        Some(SourceCursor {
            file: self.name.clone(),
            byte: 0,
            line: 0,
            record: record as u64,
            finished: record == self.records.len(),
            last_date,
        })
    }
}
