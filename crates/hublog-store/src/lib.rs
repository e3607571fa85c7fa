//! File-backed persistence for hub device-state logs and snapshots.
//!
//! This crate stores flattened state-change events as newline-delimited
//! JSON in hour-partitioned files (`YYYY/MM/DD/HH.ndjson` under a root
//! directory) and full state snapshots as timestamp-named JSON documents.
//! Partition paths are zero-padded, so lexical order is chronological and
//! range scans never need an index.
//!
//! # Features
//!
//! - Atomic partition replacement via temp file and rename
//! - Idempotent merge of fetched events into existing partitions
//! - Range reads with filters and resumable opaque cursors
//! - Tail, per-hour stats, file inventory, and daily sampling reads
//! - Snapshot documents with latest/nearest-hour selection
//! - Collector checkpoint tracking for incremental fetches
//!
//! # Example
//!
//! ```no_run
//! use hublog_store::{LogQuery, LogStore};
//!
//! let store = LogStore::new("/var/log/hublog");
//!
//! // Last 24 hours of one device, first page of 50.
//! let query = LogQuery::new().devices(["sensor.kitchen"]).limit(50);
//! let page = store.read_logs(&query)?;
//! println!("{} records", page.items.len());
//! # Ok::<(), hublog_store::Error>(())
//! ```

mod checkpoint;
mod cursor;
mod error;
mod layout;
mod query;
mod snapshot;
mod store;

pub use checkpoint::CheckpointStore;
pub use error::{Error, Result};
pub use layout::{PARTITION_EXT, hour_floor, hour_range, partition_path};
pub use query::{
    DEFAULT_LIMIT, DEFAULT_TAIL_SECONDS, DEFAULT_WINDOW_HOURS, HourBucket, LogPage, LogQuery,
    MAX_LIMIT, MONTHLY_DAYS, PartitionFile, SAMPLE_HOUR, WEEKLY_DAYS, parse_time_bound,
};
pub use snapshot::{
    DailyHourly, SNAPSHOT_LIST_DEFAULT_LIMIT, SNAPSHOT_LIST_MAX_LIMIT, SnapshotFile, SnapshotStore,
};
pub use store::LogStore;
