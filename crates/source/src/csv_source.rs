//! Per-sub-ledger CSV transfer logs.
//!
//! A ledger directory holds one folder per sub-ledger (for example `credits` and
//! `debits`). Each sub-ledger keeps its CSV exports either in a `csv/` folder or
//! directly inside it; files are read in file-name order and must be sorted by
//! date across file boundaries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::{Position, StringRecord};
use tb_core::{parse_amount, PipelineError, Record};
use tracing::debug;

use crate::{ColumnNames, RecordSource, SourceCursor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubLedger {
    pub name: String,
    pub dir: PathBuf,
}

/// Lists the sub-ledgers of a ledger directory, sorted by name.
pub fn discover_sub_ledgers(root: &Path) -> Result<Vec<SubLedger>, PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::SourceMissing(format!(
            "directory {} does not exist",
            root.display()
        )));
    }
    let entries = fs::read_dir(root)
        .map_err(|err| PipelineError::io(format!("listing {}", root.display()), err))?;

    let mut subs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::io(format!("listing {}", root.display()), err))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !path.is_dir() || name.starts_with('.') {
            continue;
        }
        let csv_dir = path.join("csv");
        let dir = if csv_dir.is_dir() { csv_dir } else { path };
        if list_csv_files(&dir)?.is_empty() {
            return Err(PipelineError::SourceMissing(format!(
                "sub-ledger {name} has no CSV files in {}",
                dir.display()
            )));
        }
        subs.push(SubLedger { name, dir });
    }
    if subs.is_empty() {
        return Err(PipelineError::SourceMissing(format!(
            "directory {} contains no sub-ledger folders",
            root.display()
        )));
    }
    subs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(subs)
}

fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let entries =
        fs::read_dir(dir).map_err(|err| PipelineError::io(format!("listing {}", dir.display()), err))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| PipelineError::io(format!("listing {}", dir.display()), err))?
            .path();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Date of the first record of a sub-ledger, if it has any.
pub fn first_record_date(sub: &SubLedger, columns: &ColumnNames) -> Result<Option<NaiveDate>, PipelineError> {
    let mut source = CsvLedgerSource::open(&sub.name, &sub.dir, columns.clone(), None)?;
    Ok(source.next_record()?.map(|record| record.date))
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndex {
    entity: usize,
    amount: usize,
    date: usize,
}

impl ColumnIndex {
    fn locate(headers: &StringRecord, columns: &ColumnNames, file: &str) -> Result<Self, PipelineError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or_else(|| PipelineError::MalformedRecord {
                    location: file.to_string(),
                    reason: format!("missing column {name:?}"),
                })
        };
        Ok(Self {
            entity: find(&columns.entity)?,
            amount: find(&columns.amount)?,
            date: find(&columns.date)?,
        })
    }
}

struct OpenFile {
    path: PathBuf,
    name: String,
    reader: csv::Reader<File>,
    index: ColumnIndex,
    before_last: Position,
    finished: bool,
}

impl OpenFile {
    fn open(path: PathBuf, columns: &ColumnNames, seek: Option<&SourceCursor>) -> Result<Self, PipelineError> {
        let name = file_name(&path);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&path)
            .map_err(|err| PipelineError::csv(path.display().to_string(), err))?;
        let headers = reader
            .headers()
            .map_err(|err| PipelineError::csv(path.display().to_string(), err))?
            .clone();
        let index = ColumnIndex::locate(&headers, columns, &name)?;

        if let Some(cursor) = seek {
            let mut pos = Position::new();
            pos.set_byte(cursor.byte)
                .set_line(cursor.line)
                .set_record(cursor.record);
            reader
                .seek(pos)
                .map_err(|err| PipelineError::csv(path.display().to_string(), err))?;
            debug!(file = %name, byte = cursor.byte, "resumed sub-ledger file");
        }
        let before_last = reader.position().clone();

        Ok(Self {
            path,
            name,
            reader,
            index,
            before_last,
            finished: false,
        })
    }

    fn cursor(&self, rewind_last: bool) -> SourceCursor {
        let pos = if rewind_last {
            &self.before_last
        } else {
            self.reader.position()
        };
        SourceCursor {
            file: self.name.clone(),
            byte: pos.byte(),
            line: pos.line(),
            record: pos.record(),
            finished: self.finished && !rewind_last,
            last_date: None,
        }
    }
}

/// Streams the CSV files of one sub-ledger, one record at a time.
pub struct CsvLedgerSource {
    name: String,
    columns: ColumnNames,
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<OpenFile>,
    origin: Option<SourceCursor>,
    row: StringRecord,
    last_date: Option<NaiveDate>,
    prev_date: Option<NaiveDate>,
    finished_files: Vec<PathBuf>,
}

impl CsvLedgerSource {
    pub fn open(
        name: &str,
        dir: &Path,
        columns: ColumnNames,
        resume: Option<&SourceCursor>,
    ) -> Result<Self, PipelineError> {
        let files = list_csv_files(dir)?;
        let mut source = Self {
            name: name.to_string(),
            columns,
            files,
            next_file: 0,
            current: None,
            origin: resume.cloned(),
            row: StringRecord::new(),
            last_date: resume.and_then(|c| c.last_date),
            prev_date: resume.and_then(|c| c.last_date),
            finished_files: Vec::new(),
        };

        let Some(cursor) = resume else {
            if source.files.is_empty() {
                return Err(PipelineError::SourceMissing(format!(
                    "sub-ledger {name} has no CSV files in {}",
                    dir.display()
                )));
            }
            return Ok(source);
        };

        match source.files.iter().position(|p| file_name(p) == cursor.file) {
            Some(idx) if cursor.finished => source.next_file = idx + 1,
            Some(idx) => {
                let path = source.files[idx].clone();
                source.current = Some(OpenFile::open(path, &source.columns, Some(cursor))?);
                source.next_file = idx + 1;
            }
            None if cursor.finished => {
                // consumed files may have been deleted; continue with later ones
                source.next_file = source
                    .files
                    .iter()
                    .position(|p| file_name(p) > cursor.file)
                    .unwrap_or(source.files.len());
            }
            None => {
                return Err(PipelineError::SourceMissing(format!(
                    "sub-ledger {name} lost partially read file {}",
                    cursor.file
                )))
            }
        }
        Ok(source)
    }

    fn open_next(&mut self) -> Result<bool, PipelineError> {
        let Some(path) = self.files.get(self.next_file).cloned() else {
            return Ok(false);
        };
        self.next_file += 1;
        debug!(source = %self.name, file = %path.display(), "opening sub-ledger file");
        self.current = Some(OpenFile::open(path, &self.columns, None)?);
        Ok(true)
    }

    fn parse_row(&self, file: &OpenFile) -> Result<Record, PipelineError> {
        let location = || format!("{}:{}", file.name, file.before_last.line());
        let field = |idx: usize| {
            self.row.get(idx).ok_or_else(|| PipelineError::MalformedRecord {
                location: location(),
                reason: format!("missing field {idx}"),
            })
        };

        let entity = field(file.index.entity)?.trim().to_string();
        let raw_amount = field(file.index.amount)?;
        let amount = parse_amount(raw_amount).ok_or_else(|| PipelineError::MalformedRecord {
            location: location(),
            reason: format!("value {raw_amount:?} is not an integer amount"),
        })?;
        let raw_date = field(file.index.date)?;
        let date = parse_date(raw_date).ok_or_else(|| PipelineError::MalformedRecord {
            location: location(),
            reason: format!("unparseable date {raw_date:?}"),
        })?;
        Ok(Record { entity, amount, date })
    }
}

/// Day-granularity dates; a trailing time of day is ignored.
fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

impl RecordSource for CsvLedgerSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_record(&mut self) -> Result<Option<Record>, PipelineError> {
        loop {
            let needs_file = self.current.as_ref().map_or(true, |file| file.finished);
            if needs_file && !self.open_next()? {
                return Ok(None);
            }
            let Some(file) = self.current.as_mut() else {
                return Ok(None);
            };

            let has_row = file
                .reader
                .read_record(&mut self.row)
                .map_err(|err| PipelineError::csv(file.path.display().to_string(), err))?;
            if !has_row {
                file.finished = true;
                self.finished_files.push(file.path.clone());
                continue;
            }
            if let Some(pos) = self.row.position() {
                file.before_last = pos.clone();
            }

            let Some(file) = self.current.as_ref() else {
                return Ok(None);
            };
            let record = self.parse_row(file)?;
            if let Some(previous) = self.last_date {
                if record.date < previous {
                    return Err(PipelineError::UnsortedSource {
                        source_name: self.name.clone(),
                        previous,
                        date: record.date,
                    });
                }
            }
            self.prev_date = self.last_date;
            self.last_date = Some(record.date);
            return Ok(Some(record));
        }
    }

    fn cursor(&self, rewind_last: bool) -> Option<SourceCursor> {
        let file = match &self.current {
            Some(file) => file,
            None => return self.origin.clone(),
        };
        let mut cursor = file.cursor(rewind_last);
        cursor.last_date = if rewind_last { self.prev_date } else { self.last_date };
        Some(cursor)
    }

    fn take_finished_files(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.finished_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &Path, name: &str, rows: &[(&str, &str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        let mut file = File::create(dir.join(name)).unwrap();
        writeln!(file, "block_date,address,value,tx_hash").unwrap();
        for (date, address, value) in rows {
            writeln!(file, "{date},{address},{value},0xabc").unwrap();
        }
    }

    fn drain(source: &mut CsvLedgerSource) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = source.next_record().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn discovers_sub_ledgers_with_csv_folders() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("bitcoin");
        write_csv(&root.join("debits").join("csv"), "d_000.csv", &[("2022-01-03", "A", "5")]);
        write_csv(&root.join("credits"), "c_000.csv", &[("2022-01-03", "A", "5")]);

        let subs = discover_sub_ledgers(&root).unwrap();
        let names: Vec<_> = subs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["credits", "debits"]);
        assert!(subs[1].dir.ends_with("csv"));
    }

    #[test]
    fn missing_directory_and_empty_sub_ledger_are_source_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let err = discover_sub_ledgers(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, PipelineError::SourceMissing(_)));

        fs::create_dir_all(tmp.path().join("ledger").join("credits")).unwrap();
        let err = discover_sub_ledgers(&tmp.path().join("ledger")).unwrap_err();
        assert!(matches!(err, PipelineError::SourceMissing(_)));
    }

    #[test]
    fn reads_files_in_name_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(tmp.path(), "part_001.csv", &[("2022-01-05", "C", "3")]);
        write_csv(
            tmp.path(),
            "part_000.csv",
            &[("2022-01-03", "A", "1"), ("2022-01-04 12:00:00 UTC", "B", "2.0")],
        );

        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        let records = drain(&mut source);
        let entities: Vec<_> = records.iter().map(|r| r.entity.as_str()).collect();
        assert_eq!(entities, ["A", "B", "C"]);
        assert_eq!(records[1].amount, 2);
        assert_eq!(source.take_finished_files().len(), 2);
    }

    #[test]
    fn rewound_cursor_rereads_the_last_record() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(
            tmp.path(),
            "part_000.csv",
            &[("2022-01-03", "A", "1"), ("2022-01-04", "B", "2"), ("2022-01-12", "C", "3")],
        );

        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        source.next_record().unwrap();
        source.next_record().unwrap();
        let cursor = source.cursor(true).unwrap();
        assert!(!cursor.finished);

        let mut resumed =
            CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), Some(&cursor)).unwrap();
        let rest: Vec<_> = drain(&mut resumed).into_iter().map(|r| r.entity).collect();
        assert_eq!(rest, ["B", "C"]);
    }

    #[test]
    fn finished_cursor_skips_deleted_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(tmp.path(), "part_000.csv", &[("2022-01-03", "A", "1")]);
        write_csv(tmp.path(), "part_001.csv", &[("2022-01-10", "B", "2")]);

        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        source.next_record().unwrap();
        source.next_record().unwrap();
        let finished = source.take_finished_files();
        assert_eq!(finished.len(), 1);
        fs::remove_file(&finished[0]).unwrap();

        // read to the end of part_001
        assert!(source.next_record().unwrap().is_none());
        let cursor = source.cursor(false).unwrap();
        assert!(cursor.finished);
        assert_eq!(cursor.file, "part_001.csv");

        write_csv(tmp.path(), "part_002.csv", &[("2022-01-17", "C", "4")]);
        let mut resumed =
            CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), Some(&cursor)).unwrap();
        let rest: Vec<_> = drain(&mut resumed).into_iter().map(|r| r.entity).collect();
        assert_eq!(rest, ["C"]);
    }

    #[test]
    fn out_of_order_dates_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(tmp.path(), "part_000.csv", &[("2022-01-05", "A", "1"), ("2022-01-04", "B", "2")]);
        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        source.next_record().unwrap();
        let err = source.next_record().unwrap_err();
        assert!(matches!(err, PipelineError::UnsortedSource { .. }));
    }

    #[test]
    fn fractional_values_are_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(tmp.path(), "part_000.csv", &[("2022-01-05", "A", "1.5")]);
        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        let err = source.next_record().unwrap_err();
        assert!(matches!(err, PipelineError::MalformedRecord { .. }));
    }

    #[test]
    fn resumed_source_rejects_records_older_than_its_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(tmp.path(), "part_000.csv", &[("2022-01-03", "A", "1"), ("2022-01-10", "B", "2")]);

        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        drain(&mut source);
        let cursor = source.cursor(false).unwrap();
        assert!(cursor.finished);
        assert_eq!(cursor.last_date, NaiveDate::from_ymd_opt(2022, 1, 10));

        // a later export that starts before the last date already handed out
        write_csv(tmp.path(), "part_001.csv", &[("2022-01-08", "C", "3")]);
        let mut resumed =
            CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), Some(&cursor)).unwrap();
        let err = resumed.next_record().unwrap_err();
        assert!(matches!(err, PipelineError::UnsortedSource { .. }));
    }

    #[test]
    fn rewound_cursor_carries_the_date_before_the_last_record() {
        let tmp = tempfile::tempdir().unwrap();
        write_csv(tmp.path(), "part_000.csv", &[("2022-01-03", "A", "1"), ("2022-01-12", "B", "2")]);

        let mut source = CsvLedgerSource::open("credits", tmp.path(), ColumnNames::default(), None).unwrap();
        source.next_record().unwrap();
        source.next_record().unwrap();
        assert_eq!(source.cursor(true).unwrap().last_date, NaiveDate::from_ymd_opt(2022, 1, 3));
        assert_eq!(source.cursor(false).unwrap().last_date, NaiveDate::from_ymd_opt(2022, 1, 12));
    }
}
