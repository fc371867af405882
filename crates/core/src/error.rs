use std::path::PathBuf;

use chrono::NaiveDate;

use crate::WindowIndex;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("source missing: {0}")]
    SourceMissing(String),

    #[error("sub-ledgers disagree on window count: {0}")]
    SourceCountMismatch(String),

    #[error("source {source_name} ran out of records at window {window}, before the configured last window {last_window}")]
    IncompleteSource {
        source_name: String,
        window: WindowIndex,
        last_window: WindowIndex,
    },

    #[error("windows must advance in order: expected window {expected}, got {got}")]
    OrderingViolation { expected: WindowIndex, got: WindowIndex },

    #[error("output column {label} does not follow {previous}")]
    ColumnOrder { previous: String, label: String },

    #[error("checkpoint and output table disagree: {0}")]
    CheckpointConsistency(String),

    #[error("checkpoint {} is unreadable: {reason}", .path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("source {source_name} is not sorted by date: {date} follows {previous}")]
    UnsortedSource {
        source_name: String,
        previous: NaiveDate,
        date: NaiveDate,
    },

    #[error("source {source_name} has a record dated {date} after window {window} began; it belongs to an earlier window")]
    LateRecord {
        source_name: String,
        date: NaiveDate,
        window: WindowIndex,
    },

    #[error("source {source_name} lost track of records: read {read}, emitted {emitted}, pending {pending}")]
    RecordConservation {
        source_name: String,
        read: u64,
        emitted: u64,
        pending: u64,
    },

    #[error("malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist {}: {source}", .target.display())]
    Persist {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error in {context}: {source}")]
    Csv {
        context: String,
        #[source]
        source: csv::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn csv(context: impl Into<String>, source: csv::Error) -> Self {
        PipelineError::Csv {
            context: context.into(),
            source,
        }
    }

    /// Raised while writing the checkpoint or the output table. Such errors must
    /// not trigger another best-effort checkpoint.
    pub fn is_persistence(&self) -> bool {
        matches!(self, PipelineError::Persist { .. })
    }

    /// Stable classification shown to operators.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidConfig(_) => "InvalidConfig",
            PipelineError::SourceMissing(_) => "SourceMissing",
            PipelineError::SourceCountMismatch(_) => "SourceCountMismatch",
            PipelineError::IncompleteSource { .. } => "IncompleteSource",
            PipelineError::OrderingViolation { .. } | PipelineError::ColumnOrder { .. } => {
                "OrderingViolation"
            }
            PipelineError::CheckpointConsistency(_) => "CheckpointConsistency",
            PipelineError::CheckpointCorrupt { .. } => "CheckpointCorrupt",
            PipelineError::UnsortedSource { .. } | PipelineError::LateRecord { .. } => "UnsortedSource",
            PipelineError::RecordConservation { .. } => "RecordConservation",
            PipelineError::MalformedRecord { .. } => "MalformedRecord",
            PipelineError::Io { .. } | PipelineError::Persist { .. } => "IOError",
            PipelineError::Csv { .. } => "CsvError",
            PipelineError::Serde(_) => "SerializationError",
        }
    }
}
