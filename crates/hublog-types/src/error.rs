//! Error types for record and timestamp parsing in hublog-types.

use thiserror::Error;

/// Errors that can occur when parsing timestamps or building records.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// A timestamp string could not be parsed as RFC 3339.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A timestamp could not be rendered as RFC 3339 (out-of-range year).
    #[error("unrepresentable timestamp: {0}")]
    FormatTimestamp(String),
}

/// Result type alias using hublog-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
