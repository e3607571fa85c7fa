//! Error types for hublog-store.

use std::path::PathBuf;

/// Result type for hublog-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hublog-store.
///
/// Only [`Error::InvalidCursor`] and [`Error::InvalidTimeRange`] are caller
/// mistakes worth surfacing through a request layer; the rest are write-path
/// failures. Read paths deliberately produce empty results instead of errors
/// when files are missing or lines fail to parse.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed pagination cursor supplied by a caller.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Unparsable `from`/`to` bound supplied by a caller.
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Failed to create a partition directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A timestamp could not be parsed or rendered.
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] hublog_types::ParseError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
