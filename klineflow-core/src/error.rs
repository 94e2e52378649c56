//! Structured error types for the extraction half of the pipeline.
//!
//! Every variant carries enough context (symbol, path, operation) for an
//! operator to re-run the failed unit by hand.

use thiserror::Error;

/// An object path that does not follow the kline layout.
///
/// Non-fatal: callers exclude such objects from watermark and grouping
/// computations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("malformed object path '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("timestamp {timestamp_ms} cannot be rendered as a UTC calendar time")]
    TimestampOutOfRange { timestamp_ms: i64 },
}

impl PathError {
    pub(crate) fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures of the object storage collaborator or the columnar codec.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("parquet encoding error: {0}")]
    Columnar(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A single failed attempt against the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors that abort one symbol's extraction cycle.
///
/// None of these escalate beyond the symbol: sibling loops keep running and
/// the next scheduled cycle re-derives the same watermark.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("upstream unavailable for {symbol} after {attempts} attempts: {last}")]
    UpstreamUnavailable {
        symbol: String,
        attempts: u32,
        last: SourceError,
    },

    #[error("storage write failed for {path}: {source}")]
    StorageWrite {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("data integrity error for {symbol}: {detail}")]
    DataIntegrity { symbol: String, detail: String },

    #[error("invalid object path: {0}")]
    Path(#[from] PathError),
}

impl ExtractError {
    pub(crate) fn integrity(symbol: &str, detail: impl Into<String>) -> Self {
        Self::DataIntegrity {
            symbol: symbol.to_string(),
            detail: detail.into(),
        }
    }
}
