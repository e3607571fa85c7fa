//! Read side of the event log: range reads with resumable cursors, tail
//! windows, per-hour statistics, file inventories, and daily sampling.
//!
//! Every operation here is stateless and read-only. Writers replace whole
//! partition files atomically, so these scans are safe to run from any
//! number of concurrent callers while the collector loop keeps writing.
//!
//! Missing partitions mean "no data" and never raise errors; only a
//! malformed cursor or an unparsable time bound is worth surfacing.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::layout::{hour_floor, hour_range};
use crate::store::LogStore;

/// Hours covered by a range read when no explicit bounds are given.
pub const DEFAULT_WINDOW_HOURS: i64 = 24;
/// Result-set size used when a query does not set one.
pub const DEFAULT_LIMIT: usize = 200;
/// Hard ceiling on a single page of results.
pub const MAX_LIMIT: usize = 5000;
/// Tail window used when a caller does not say how far back to look.
pub const DEFAULT_TAIL_SECONDS: u64 = 3600;
/// Hour of day sampled by the weekly/monthly convenience reads.
pub const SAMPLE_HOUR: u8 = 12;
/// Days covered by a weekly sample.
pub const WEEKLY_DAYS: u32 = 7;
/// Days covered by a monthly sample.
pub const MONTHLY_DAYS: u32 = 30;

/// Parse a caller-supplied ISO-8601 bound.
///
/// This is the translation point for transport-level string parameters:
/// failures surface as [`Error::InvalidTimeRange`] rather than a bare parse
/// error.
pub fn parse_time_bound(s: &str) -> Result<OffsetDateTime> {
    hublog_types::parse_timestamp(s).map_err(|_| Error::InvalidTimeRange(s.to_owned()))
}

/// Fluent filter/pagination settings for event-log reads.
///
/// All filters are optional and combine with AND. The same query value
/// drives [`LogStore::read_logs`], [`LogStore::read_tail`] and the sampling
/// reads; operations that define their own window simply ignore the
/// `since`/`until`/`cursor` fields.
///
/// # Example
///
/// ```
/// use hublog_store::LogQuery;
/// use time::macros::datetime;
///
/// let query = LogQuery::new()
///     .since(datetime!(2025-11-03 00:00 UTC))
///     .until(datetime!(2025-11-03 06:00 UTC))
///     .devices(["sensor.kitchen"])
///     .status("on")
///     .limit(100);
/// assert_eq!(query.limit, 100);
/// ```
#[derive(Debug, Clone)]
pub struct LogQuery {
    /// Lower window bound; defaults to `DEFAULT_WINDOW_HOURS` before now.
    pub since: Option<OffsetDateTime>,
    /// Upper window bound; defaults to now.
    pub until: Option<OffsetDateTime>,
    /// Exact-match device ids; empty means no device filter.
    pub device_ids: BTreeSet<String>,
    /// Exact-match status filter.
    pub status: Option<String>,
    /// Substring filter applied to the raw serialized line.
    pub text: Option<String>,
    /// Opaque resumption token from a previous page.
    pub cursor: Option<String>,
    /// Page size, always within `[1, MAX_LIMIT]`.
    pub limit: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            device_ids: BTreeSet::new(),
            status: None,
            text: None,
            cursor: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl LogQuery {
    /// Create a query with default window and limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read records from partitions at or after this time.
    #[must_use]
    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Read records from partitions at or before this time.
    #[must_use]
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    /// Only include records whose device id is in `ids`.
    #[must_use]
    pub fn devices<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Only include records with exactly this status.
    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Only include records whose raw line contains `text`.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Resume from a cursor returned by an earlier page.
    #[must_use]
    pub fn cursor(mut self, token: impl Into<String>) -> Self {
        self.cursor = Some(token.into());
        self
    }

    /// Cap the page size; values are clamped to `[1, MAX_LIMIT]`.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIMIT);
        self
    }

    fn window(&self, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        resolve_window(self.since, self.until, now)
    }

    fn matches(&self, obj: &Value, raw_line: &str) -> bool {
        if !self.device_ids.is_empty() && !field_in_set(obj, "device_id", &self.device_ids) {
            return false;
        }
        if let Some(status) = &self.status {
            if !field_equals(obj, "status", status) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            if !text.is_empty() && !raw_line.contains(text.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One page of a range read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogPage {
    /// Records in partition order, exactly as stored.
    pub items: Vec<Value>,
    /// Present when the page filled up before the window was exhausted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Per-hour record count, including zero-count hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    #[serde(with = "time::serde::rfc3339")]
    pub hour: OffsetDateTime,
    pub count: u64,
}

/// Inventory entry for one existing partition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionFile {
    pub path: PathBuf,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
}

impl LogStore {
    /// Range read over the query's window with resumable pagination.
    ///
    /// Partitions are visited in ascending hour order; within each, lines
    /// are scanned in file order, corrupt ones skipped. When the page fills
    /// up, the returned cursor points at the byte right after the last
    /// consumed line, so the follow-up call continues with no duplicates
    /// and no gaps. Partitions lexically before the cursor's path are
    /// skipped without being opened.
    pub fn read_logs(&self, query: &LogQuery) -> Result<LogPage> {
        let (from, to) = query.window(OffsetDateTime::now_utc());
        let cursor = match &query.cursor {
            Some(token) => Some(Cursor::decode(token)?),
            None => None,
        };

        let mut items = Vec::new();
        for hour in hour_range(from, to) {
            let path = self.partition_path(hour);
            let path_str = path.to_string_lossy().into_owned();

            let mut offset = 0u64;
            if let Some(cur) = &cursor {
                if path_str.as_str() < cur.path.as_str() {
                    continue;
                }
                if path_str == cur.path {
                    offset = cur.offset;
                }
            }

            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut reader = BufReader::new(file);
            if offset > 0 {
                reader.seek(SeekFrom::Start(offset))?;
            }

            let mut pos = offset;
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line)?;
                if n == 0 {
                    break;
                }
                pos += n as u64;
                let Ok(obj) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if !query.matches(&obj, &line) {
                    continue;
                }
                items.push(obj);
                if items.len() >= query.limit {
                    let token = Cursor::new(path_str, pos).encode()?;
                    return Ok(LogPage {
                        items,
                        next_cursor: Some(token),
                    });
                }
            }
        }
        Ok(LogPage {
            items,
            next_cursor: None,
        })
    }

    /// Recent records, newest first.
    ///
    /// Scans `[now - since_seconds, now]` in chronological order, then
    /// returns the last `query.limit` matches reversed. The query's window
    /// and cursor fields are ignored. A `since_seconds` reaching past the
    /// representable date range is rejected as [`Error::InvalidTimeRange`].
    pub fn read_tail(&self, since_seconds: u64, query: &LogQuery) -> Result<Vec<Value>> {
        let now = OffsetDateTime::now_utc();
        let span = Duration::seconds(since_seconds.min(i64::MAX as u64) as i64);
        let from = now.checked_sub(span).ok_or_else(|| {
            Error::InvalidTimeRange(format!("{since_seconds} seconds before now is out of range"))
        })?;

        let mut buf = Vec::new();
        for hour in hour_range(from, now) {
            scan_lines(&self.partition_path(hour), |line| {
                if let Ok(obj) = serde_json::from_str::<Value>(line) {
                    if query.matches(&obj, line) {
                        buf.push(obj);
                    }
                }
                true
            })?;
        }

        let start = buf.len().saturating_sub(query.limit);
        let mut items = buf.split_off(start);
        items.reverse();
        Ok(items)
    }

    /// Per-hour parseable-line counts over the window.
    ///
    /// Every hour in the window gets a bucket, zero-valued when its
    /// partition is missing. No record filters apply here.
    pub fn stats(
        &self,
        since: Option<OffsetDateTime>,
        until: Option<OffsetDateTime>,
    ) -> Result<Vec<HourBucket>> {
        let (from, to) = resolve_window(since, until, OffsetDateTime::now_utc());

        let mut buckets = Vec::new();
        for hour in hour_range(from, to) {
            let mut count = 0u64;
            scan_lines(&self.partition_path(hour), |line| {
                if serde_json::from_str::<Value>(line).is_ok() {
                    count += 1;
                }
                true
            })?;
            buckets.push(HourBucket { hour, count });
        }
        Ok(buckets)
    }

    /// Path, size and mtime of each partition file existing in the window.
    pub fn list_files(
        &self,
        since: Option<OffsetDateTime>,
        until: Option<OffsetDateTime>,
    ) -> Result<Vec<PartitionFile>> {
        let (from, to) = resolve_window(since, until, OffsetDateTime::now_utc());

        let mut files = Vec::new();
        for hour in hour_range(from, to) {
            let path = self.partition_path(hour);
            let meta = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            files.push(PartitionFile {
                path,
                size: meta.len(),
                modified: OffsetDateTime::from(meta.modified()?),
            });
        }
        Ok(files)
    }

    /// Matching records from the `sample_hour` partition of each of the
    /// last `days` calendar days, most recent day first.
    ///
    /// Days whose sample partition is absent are skipped entirely; there is
    /// no nearest-hour fallback in this storage mode. `query.limit` caps
    /// the whole call. Sample hours above 23 are treated as 23.
    pub fn read_daily_sample(
        &self,
        days: u32,
        sample_hour: u8,
        query: &LogQuery,
    ) -> Result<Vec<Value>> {
        let now = OffsetDateTime::now_utc();
        let midnight = hour_floor(now) - Duration::hours(i64::from(now.hour()));
        let anchor = midnight + Duration::hours(i64::from(sample_hour.min(23)));

        let mut items = Vec::new();
        for day_offset in 0..days {
            // Walking past the calendar floor cannot find more partitions.
            let Some(target) = anchor.checked_sub(Duration::days(i64::from(day_offset))) else {
                break;
            };
            let mut full = false;
            scan_lines(&self.partition_path(target), |line| {
                let Ok(obj) = serde_json::from_str::<Value>(line) else {
                    return true;
                };
                if query.matches(&obj, line) {
                    items.push(obj);
                    if items.len() >= query.limit {
                        full = true;
                        return false;
                    }
                }
                true
            })?;
            if full {
                break;
            }
        }
        Ok(items)
    }

    /// Noon samples for the last week.
    pub fn read_weekly_sample(&self, query: &LogQuery) -> Result<Vec<Value>> {
        self.read_daily_sample(WEEKLY_DAYS, SAMPLE_HOUR, query)
    }

    /// Noon samples for the last 30 days.
    pub fn read_monthly_sample(&self, query: &LogQuery) -> Result<Vec<Value>> {
        self.read_daily_sample(MONTHLY_DAYS, SAMPLE_HOUR, query)
    }
}

fn resolve_window(
    since: Option<OffsetDateTime>,
    until: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> (OffsetDateTime, OffsetDateTime) {
    let from = since.unwrap_or_else(|| hour_floor(now) - Duration::hours(DEFAULT_WINDOW_HOURS));
    let to = until.unwrap_or(now);
    if to < from { (to, from) } else { (from, to) }
}

/// Visit each line of a partition file; a missing file is a no-op.
///
/// The visitor returns `false` to stop the scan early.
fn scan_lines(path: &Path, mut visit: impl FnMut(&str) -> bool) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if !visit(&line) {
            return Ok(());
        }
    }
}

fn field_in_set(obj: &Value, key: &str, set: &BTreeSet<String>) -> bool {
    match obj.get(key) {
        Some(Value::String(s)) => set.contains(s),
        Some(Value::Number(n)) => set.contains(&n.to_string()),
        _ => false,
    }
}

fn field_equals(obj: &Value, key: &str, wanted: &str) -> bool {
    match obj.get(key) {
        Some(Value::String(s)) => s == wanted,
        Some(Value::Number(n)) => n.to_string() == wanted,
        _ => false,
    }
}
