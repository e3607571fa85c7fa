//! Partition layout: the mapping from timestamps to hour-bucketed paths.
//!
//! Partitions live at `root/YYYY/MM/DD/HH.ndjson`, all components UTC and
//! zero-padded, so lexical path order equals chronological order. Everything
//! here is a pure function of its inputs.

use std::path::{Path, PathBuf};

use time::{Duration, OffsetDateTime, UtcOffset};

/// File extension used by event-log partitions.
pub const PARTITION_EXT: &str = "ndjson";

/// Truncate a timestamp to the start of its UTC hour.
///
/// # Examples
///
/// ```
/// use hublog_store::hour_floor;
/// use time::macros::datetime;
///
/// let floored = hour_floor(datetime!(2025-11-03 05:47:31.5 UTC));
/// assert_eq!(floored, datetime!(2025-11-03 05:00 UTC));
/// ```
#[must_use]
pub fn hour_floor(ts: OffsetDateTime) -> OffsetDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    let into_hour = Duration::minutes(i64::from(utc.minute()))
        + Duration::seconds(i64::from(utc.second()))
        + Duration::nanoseconds(i64::from(utc.nanosecond()));
    utc - into_hour
}

/// The closed sequence of hour floors between `from` and `to`.
///
/// Bounds are swapped when inverted, so the result is never empty.
#[must_use]
pub fn hour_range(from: OffsetDateTime, to: OffsetDateTime) -> Vec<OffsetDateTime> {
    let (from, to) = if to < from { (to, from) } else { (from, to) };
    let end = hour_floor(to);
    let mut cur = hour_floor(from);
    let mut hours = Vec::new();
    while cur <= end {
        hours.push(cur);
        cur += Duration::hours(1);
    }
    hours
}

/// Path of the partition covering `ts`, under `root`.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use hublog_store::partition_path;
/// use time::macros::datetime;
///
/// let path = partition_path(Path::new("/var/log/hublog"), datetime!(2025-11-03 05:47 UTC));
/// assert_eq!(path, Path::new("/var/log/hublog/2025/11/03/05.ndjson"));
/// ```
#[must_use]
pub fn partition_path(root: &Path, ts: OffsetDateTime) -> PathBuf {
    let h = hour_floor(ts);
    root.join(format!(
        "{:04}/{:02}/{:02}/{:02}.{PARTITION_EXT}",
        h.year(),
        u8::from(h.month()),
        h.day(),
        h.hour()
    ))
}

/// Sibling temp path a partition is staged at before its atomic rename.
pub(crate) fn temp_path(final_path: &Path) -> PathBuf {
    let mut os = final_path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}
