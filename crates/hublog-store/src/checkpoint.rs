//! Durable marker of the last fully-merged history window.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::debug;

use hublog_types::{format_timestamp, parse_timestamp};

use crate::error::{Error, Result};

/// Name of the checkpoint file kept next to the partitions.
pub const CHECKPOINT_FILE: &str = ".checkpoint";

/// File-backed checkpoint holding one RFC 3339 UTC timestamp.
///
/// Reading is deliberately forgiving: a missing file, an unreadable file,
/// or garbage content all come back as `None`, and the backfill planner
/// then falls back to its bounded lookback floor. Merges stay idempotent,
/// so re-covering old windows after a lost checkpoint is safe.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Create a checkpoint store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The conventional checkpoint location for an event-log root.
    #[must_use]
    pub fn for_root(root: &Path) -> Self {
        Self::new(root.join(CHECKPOINT_FILE))
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint, treating absence or garbage as "no checkpoint".
    #[must_use]
    pub fn read(&self) -> Option<OffsetDateTime> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "checkpoint unreadable");
                return None;
            }
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return None;
        }
        match parse_timestamp(trimmed) {
            Ok(ts) => Some(ts),
            Err(_) => {
                debug!(path = %self.path.display(), content = trimmed, "checkpoint unparsable");
                None
            }
        }
    }

    /// Persist `ts` as the new checkpoint.
    pub fn write(&self, ts: OffsetDateTime) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::write(&self.path, format_timestamp(ts)?)?;
        Ok(())
    }
}
