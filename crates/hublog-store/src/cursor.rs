//! Opaque pagination cursors for resumable range reads.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Resumption point for a paginated range read.
///
/// Holds the partition file a scan stopped in and the byte offset of the
/// first unread line. Offsets are only ever taken right after a full line
/// was consumed, so seeking to one always lands on a record boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub path: String,
    pub offset: u64,
}

impl Cursor {
    /// Create a cursor for `path` at `offset`.
    #[must_use]
    pub fn new(path: impl Into<String>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    /// Encode this cursor as an opaque token (base64 over JSON).
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        Ok(BASE64.encode(json.as_bytes()))
    }

    /// Decode a token produced by [`Cursor::encode`].
    ///
    /// Every decoding failure maps to [`Error::InvalidCursor`]; callers never
    /// see base64 or JSON details.
    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || Error::InvalidCursor(token.to_owned());
        let bytes = BASE64.decode(token.as_bytes()).map_err(|_| invalid())?;
        let json = String::from_utf8(bytes).map_err(|_| invalid())?;
        serde_json::from_str(&json).map_err(|_| invalid())
    }
}
