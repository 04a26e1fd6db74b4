//! Centralized error handling for tabletalk.
//!
//! The taxonomy mirrors how each failure is treated by the pipeline:
//!
//! - [`EdaError::Configuration`] is fatal and surfaced immediately.
//! - [`RowError`] is recorded per malformed row and never aborts a scan.
//! - [`PartitionReadError`] is recorded per failed partition; aggregation
//!   continues with reduced coverage.
//! - [`InsufficientData`] marks a single undefined statistic; the rest of the
//!   result is unaffected.
//! - [`EdaError::ExternalService`] is raised by the LLM collaborator and is
//!   always absorbed by the router, which falls back to a canned answer.
//!
//! The three "recorded" kinds are plain data so they can be embedded in
//! results. Each one can still be lifted into an [`EdaError`] when a caller
//! wants to treat it as a hard failure.
//!
//! ```
//! use tabletalk::error::EdaError;
//!
//! fn describe(err: &EdaError) -> &'static str {
//!     match err {
//!         EdaError::Configuration(_) => "fix your input",
//!         EdaError::Cancelled => "run was cancelled",
//!         _ => "something else",
//!     }
//! }
//! assert_eq!(describe(&EdaError::Cancelled), "run was cancelled");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A row that could not be coerced to the dataset schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub partition_index: usize,
    /// Offset of the row inside its partition.
    pub row_offset: usize,
    pub reason: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {} of partition {}: {}",
            self.row_offset, self.partition_index, self.reason
        )
    }
}

/// Why a partition could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionFailure {
    Io(String),
    Timeout { after_ms: u64 },
}

/// A partition that was skipped during aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReadError {
    pub partition_index: usize,
    pub failure: PartitionFailure,
}

impl fmt::Display for PartitionReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failure {
            PartitionFailure::Io(msg) => {
                write!(f, "partition {} failed: {msg}", self.partition_index)
            }
            PartitionFailure::Timeout { after_ms } => write!(
                f,
                "partition {} timed out after {after_ms}ms",
                self.partition_index
            ),
        }
    }
}

/// A statistic that is undefined for a column (or column pair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsufficientData {
    pub column: String,
    pub statistic: String,
    pub reason: String,
}

impl fmt::Display for InsufficientData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} undefined for '{}': {}",
            self.statistic, self.column, self.reason
        )
    }
}

/// Main error type for tabletalk operations.
#[derive(Debug)]
pub enum EdaError {
    /// Bad or unknown size, policy or settings input
    Configuration(String),

    /// A per-row coercion failure, lifted to an error
    Row(RowError),

    /// A partition read failure, lifted to an error
    PartitionRead(PartitionReadError),

    /// An undefined statistic, lifted to an error
    InsufficientData(InsufficientData),

    /// LLM collaborator unreachable, timed out or returned nothing
    ExternalService(String),

    /// No dataset registered under this fingerprint
    DatasetNotFound(String),

    /// Aggregation cancelled by the caller
    Cancelled,

    /// I/O errors (file operations, spooling, memory log)
    Io(std::io::Error),

    /// CSV parsing errors outside per-row coercion
    Csv(String),

    /// JSON (de)serialization errors
    Serialization(String),

    /// Generic error with context
    Other(String),
}

impl fmt::Display for EdaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            Self::Row(e) => write!(f, "Row error: {e}"),
            Self::PartitionRead(e) => write!(f, "Partition read error: {e}"),
            Self::InsufficientData(e) => write!(f, "Insufficient data: {e}"),
            Self::ExternalService(msg) => write!(f, "External service error: {msg}"),
            Self::DatasetNotFound(fp) => write!(f, "Dataset not found: {fp}"),
            Self::Cancelled => write!(f, "Aggregation cancelled"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Csv(msg) => write!(f, "CSV error: {msg}"),
            Self::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for EdaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EdaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for EdaError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err.to_string())
    }
}

impl From<serde_json::Error> for EdaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for EdaError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<RowError> for EdaError {
    fn from(err: RowError) -> Self {
        Self::Row(err)
    }
}

impl From<PartitionReadError> for EdaError {
    fn from(err: PartitionReadError) -> Self {
        Self::PartitionRead(err)
    }
}

impl From<InsufficientData> for EdaError {
    fn from(err: InsufficientData) -> Self {
        Self::InsufficientData(err)
    }
}

/// Result type alias for tabletalk operations.
pub type Result<T> = std::result::Result<T, EdaError>;

/// Extension trait to add context to results.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// Add context using a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<EdaError>,
{
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err: EdaError = e.into();
            EdaError::Other(format!("{}: {}", msg.into(), err))
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err: EdaError = e.into();
            EdaError::Other(format!("{}: {}", f(), err))
        })
    }
}
