//! Error taxonomy for the calibration pipeline.
//!
//! Every failure carries a machine-readable [`ErrorKind`] so callers can pick a
//! remediation without parsing messages. Row-level problems are *not* errors
//! on their own: they are accumulated as [`RowRejection`] values inside the
//! provenance record, and only surface as [`CalibError::RowRejected`] when a
//! file yields no valid rows at all.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::ProvenanceRecord;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CalibError>;

/// Fieldless discriminant of [`CalibError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Schema,
    RowRejected,
    InsufficientData,
    RegressionDrift,
    Configuration,
    Io,
    Json,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Schema => "SchemaError",
            Self::RowRejected => "RowRejected",
            Self::InsufficientData => "InsufficientData",
            Self::RegressionDrift => "RegressionDrift",
            Self::Configuration => "ConfigurationError",
            Self::Io => "IoError",
            Self::Json => "JsonError",
        };
        f.write_str(s)
    }
}

/// Why a single data row was refused by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RejectReason {
    /// Row has a different number of fields than the header.
    ColumnCount { expected: usize, found: usize },
    /// `bit` is not exactly the literal `0` or `1`.
    InvalidBit { value: String },
    EmptyTimestamp,
    /// `timestamp` could not be parsed as RFC 3339.
    UnparseableTimestamp { value: String },
    /// `timestamp` parsed, but carries no UTC offset.
    AmbiguousTimestamp { value: String },
    EmptySourceId,
    SourceIdTooLong { length: usize, max: usize },
    /// `s` is present but not a finite number.
    InvalidCovariate { value: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColumnCount { expected, found } => {
                write!(f, "expected {expected} fields, found {found}")
            }
            Self::InvalidBit { value } => write!(f, "invalid bit value {value:?} (must be 0 or 1)"),
            Self::EmptyTimestamp => f.write_str("empty timestamp"),
            Self::UnparseableTimestamp { value } => {
                write!(f, "unparseable timestamp {value:?}")
            }
            Self::AmbiguousTimestamp { value } => {
                write!(f, "ambiguous timestamp {value:?} (no UTC offset)")
            }
            Self::EmptySourceId => f.write_str("empty source_id"),
            Self::SourceIdTooLong { length, max } => {
                write!(f, "source_id too long ({length} > {max} chars)")
            }
            Self::InvalidCovariate { value } => {
                write!(f, "invalid covariate s {value:?} (must be a finite number)")
            }
        }
    }
}

/// A rejected row: 1-based line number in the input file plus the rule it broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    pub line: usize,
    pub reason: RejectReason,
}

impl fmt::Display for RowRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum CalibError {
    /// File-level contract violation (missing/duplicate column, no header, not UTF-8).
    #[error("schema error in {file}: {detail}")]
    Schema { file: String, detail: String },

    /// Every data row of a file was rejected. The provenance record still
    /// lists each rejection.
    #[error("{}: all {} data row(s) rejected (first: {})",
        .provenance.filename,
        .provenance.rows_rejected,
        .provenance.rejections.first().map(|r| r.to_string()).unwrap_or_default())]
    RowRejected { provenance: Box<ProvenanceRecord> },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("regression drift in {check}: {detail}")]
    RegressionDrift { check: String, detail: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CalibError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema { .. } => ErrorKind::Schema,
            Self::RowRejected { .. } => ErrorKind::RowRejected,
            Self::InsufficientData(_) => ErrorKind::InsufficientData,
            Self::RegressionDrift { .. } => ErrorKind::RegressionDrift,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Io { .. } => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
