//! Flat store of full device-state snapshots, one JSON document per
//! capture.
//!
//! Files live directly under the root as `<RFC 3339 UTC>.json`, e.g.
//! `2025-11-03T05:00:00Z.json`, each holding a nested array: one inner
//! array of events per entity. Reads are deliberately forgiving and return
//! an empty result on any failure; a snapshot that cannot be read is
//! treated the same as one that was never captured.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::layout::{hour_floor, temp_path};

/// Snapshot listing size used when the caller passes zero.
pub const SNAPSHOT_LIST_DEFAULT_LIMIT: usize = 10;
/// Hard ceiling on a snapshot listing.
pub const SNAPSHOT_LIST_MAX_LIMIT: usize = 100;

const SNAPSHOT_EXT: &str = "json";

/// Store of timestamp-named snapshot documents.
///
/// # Example
///
/// ```no_run
/// use hublog_store::SnapshotStore;
///
/// let store = SnapshotStore::new("/var/lib/hublog/snapshots");
/// let latest = store.read(None, None);
/// println!("{} entities in latest snapshot", latest.len());
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

/// Inventory entry for one snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFile {
    /// Timestamp portion of the file name.
    pub timestamp: String,
    pub path: PathBuf,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
}

/// One day's snapshots grouped by hour of day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyHourly {
    /// Calendar date as `YYYY-MM-DD`.
    pub date: String,
    /// Two-digit hour keys, only hours that kept any data.
    pub hours: BTreeMap<String, Vec<Value>>,
}

impl SnapshotStore {
    /// Create a handle rooted at `root`. Nothing is touched until the
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory snapshots are stored under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read one snapshot document.
    ///
    /// With a timestamp, reads exactly `<root>/<timestamp>.json`; without
    /// one, reads the snapshot whose file-name timestamp parses latest.
    /// When `entities` is given, only entity arrays whose first event
    /// belongs to one of the listed ids are kept. Any failure, including a
    /// missing file, yields an empty vec.
    #[must_use]
    pub fn read(
        &self,
        timestamp: Option<&str>,
        entities: Option<&BTreeSet<String>>,
    ) -> Vec<Value> {
        let path = match timestamp {
            Some(ts) => {
                if ts.contains(['/', '\\']) {
                    warn!(timestamp = ts, "rejecting snapshot name with path separators");
                    return Vec::new();
                }
                self.root.join(format!("{ts}.{SNAPSHOT_EXT}"))
            }
            None => match self.entries().into_iter().max_by_key(|entry| entry.0) {
                Some((_, path)) => path,
                None => {
                    debug!(root = %self.root.display(), "no snapshots present");
                    return Vec::new();
                }
            },
        };

        let Some(items) = read_nested(&path) else {
            return Vec::new();
        };
        match entities {
            Some(filter) => filter_entities(items, filter),
            None => items,
        }
    }

    /// Newest snapshots first, up to `limit` entries.
    ///
    /// `None` means [`SNAPSHOT_LIST_DEFAULT_LIMIT`]; explicit values are
    /// clamped into `[1, SNAPSHOT_LIST_MAX_LIMIT]`.
    #[must_use]
    pub fn list_files(&self, limit: Option<usize>) -> Vec<SnapshotFile> {
        let limit = match limit {
            Some(n) => n.clamp(1, SNAPSHOT_LIST_MAX_LIMIT),
            None => SNAPSHOT_LIST_DEFAULT_LIMIT,
        };

        let mut entries = self.entries();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.truncate(limit);

        let mut files = Vec::with_capacity(entries.len());
        for (ts, path) in entries {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let timestamp = match hublog_types::format_timestamp(ts) {
                Ok(s) => s,
                Err(_) => continue,
            };
            files.push(SnapshotFile {
                timestamp,
                path,
                size: meta.len(),
                modified: OffsetDateTime::from(modified),
            });
        }
        files
    }

    /// One snapshot per day for the last `days` days, oldest day first,
    /// concatenated into a single nested array.
    ///
    /// For each day the snapshot at exactly `sample_hour` is preferred;
    /// otherwise the file whose hour is nearest wins, ties going to the
    /// earlier hour. Days without any snapshot are skipped. No entity
    /// filter applies in this mode.
    #[must_use]
    pub fn daily_sample(&self, days: u32, sample_hour: u8) -> Vec<Value> {
        let mut by_date: BTreeMap<time::Date, Vec<(OffsetDateTime, PathBuf)>> = BTreeMap::new();
        for (ts, path) in self.entries() {
            by_date.entry(ts.date()).or_default().push((ts, path));
        }

        let now = OffsetDateTime::now_utc();
        let midnight = hour_floor(now) - Duration::hours(i64::from(now.hour()));
        let anchor = midnight + Duration::hours(i64::from(sample_hour.min(23)));

        let mut picked: Vec<(time::Date, Vec<Value>)> = Vec::new();
        for day_offset in 0..days {
            // Walking past the calendar floor cannot find more snapshots.
            let Some(target) = anchor.checked_sub(Duration::days(i64::from(day_offset))) else {
                break;
            };
            let Some(candidates) = by_date.get(&target.date()) else {
                continue;
            };
            let chosen = candidates
                .iter()
                .find(|(ts, _)| *ts == target)
                .or_else(|| {
                    candidates
                        .iter()
                        .min_by_key(|(ts, _)| (ts.hour().abs_diff(sample_hour.min(23)), *ts))
                });
            let Some((_, path)) = chosen else {
                continue;
            };
            if let Some(items) = read_nested(path) {
                picked.push((target.date(), items));
            }
        }

        picked.sort_by_key(|(date, _)| *date);
        picked.into_iter().flat_map(|(_, items)| items).collect()
    }

    /// All of one day's snapshots, grouped by two-digit hour.
    ///
    /// Entity arrays that are empty, malformed, or filtered out are
    /// dropped, as are hours left with nothing. When two snapshots share
    /// an hour the one with the later timestamp wins.
    #[must_use]
    pub fn daily_hourly(
        &self,
        date: time::Date,
        entities: Option<&BTreeSet<String>>,
    ) -> DailyHourly {
        let mut day_files: Vec<(OffsetDateTime, PathBuf)> = self
            .entries()
            .into_iter()
            .filter(|(ts, _)| ts.date() == date)
            .collect();
        day_files.sort_by_key(|(ts, _)| *ts);

        let mut hours = BTreeMap::new();
        for (ts, path) in day_files {
            let Some(items) = read_nested(&path) else {
                continue;
            };
            let kept: Vec<Value> = items
                .into_iter()
                .filter(|entry| match entry.as_array() {
                    Some(events) if !events.is_empty() => match entities {
                        Some(filter) => first_entity_in(events, filter),
                        None => true,
                    },
                    _ => false,
                })
                .collect();
            if !kept.is_empty() {
                hours.insert(format!("{:02}", ts.hour()), kept);
            }
        }

        DailyHourly {
            date: format!(
                "{:04}-{:02}-{:02}",
                date.year(),
                u8::from(date.month()),
                date.day()
            ),
            hours,
        }
    }

    /// Persist a snapshot for the hour containing `window_start`.
    ///
    /// Writes to a sibling temp file and renames into place, so readers
    /// only ever see absent or complete snapshots. Returns the final path.
    pub fn write(&self, window_start: OffsetDateTime, payload: &[Value]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|source| crate::error::Error::CreateDirectory {
            path: self.root.clone(),
            source,
        })?;

        let stamp = hublog_types::format_timestamp(hour_floor(window_start))?;
        let path = self.root.join(format!("{stamp}.{SNAPSHOT_EXT}"));
        let temp = temp_path(&path);

        let result = write_document(&temp, payload)
            .and_then(|()| fs::rename(&temp, &path).map_err(crate::error::Error::from));
        if let Err(e) = result {
            debug!(path = %temp.display(), "removing stale temp file");
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        info!(path = %path.display(), entities = payload.len(), "snapshot written");
        Ok(path)
    }

    /// Snapshot files with a parseable timestamp name, in directory order.
    fn entries(&self) -> Vec<(OffsetDateTime, PathBuf)> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension() != Some(OsStr::new(SNAPSHOT_EXT)) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(OsStr::to_str) else {
                continue;
            };
            let Ok(ts) = hublog_types::parse_timestamp(stem) else {
                continue;
            };
            out.push((ts, path));
        }
        out
    }
}

fn write_document(path: &Path, payload: &[Value]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    serde_json::to_writer(&mut file, payload)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

fn read_nested(path: &Path) -> Option<Vec<Value>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read snapshot");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(items)) => Some(items),
        Ok(_) => {
            warn!(path = %path.display(), "snapshot is not a JSON array");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse snapshot");
            None
        }
    }
}

fn filter_entities(items: Vec<Value>, filter: &BTreeSet<String>) -> Vec<Value> {
    items
        .into_iter()
        .filter(|entry| match entry.as_array() {
            Some(events) if !events.is_empty() => first_entity_in(events, filter),
            _ => false,
        })
        .collect()
}

fn first_entity_in(events: &[Value], filter: &BTreeSet<String>) -> bool {
    match events[0].get("entity_id") {
        Some(Value::String(id)) => filter.contains(id),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use time::macros::{date, datetime};

    fn write_snapshot(root: &Path, name: &str, body: &Value) {
        fs::create_dir_all(root).unwrap();
        fs::write(
            root.join(format!("{name}.json")),
            serde_json::to_string(body).unwrap(),
        )
        .unwrap();
    }

    fn entity_events(id: &str, state: &str) -> Value {
        json!([{ "entity_id": id, "state": state }])
    }

    #[test]
    fn test_read_exact_timestamp() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        write_snapshot(
            dir.path(),
            "2025-11-03T05:00:00Z",
            &json!([entity_events("sensor.a", "20.5")]),
        );

        let items = store.read(Some("2025-11-03T05:00:00Z"), None);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0][0]["entity_id"], "sensor.a");

        assert!(store.read(Some("2025-11-03T09:00:00Z"), None).is_empty());
        assert!(store.read(Some("../../etc/passwd"), None).is_empty());
    }

    #[test]
    fn test_read_tolerates_bad_content() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        fs::write(dir.path().join("2025-11-03T05:00:00Z.json"), "{nope").unwrap();
        write_snapshot(dir.path(), "2025-11-03T06:00:00Z", &json!({"not": "an array"}));

        assert!(store.read(Some("2025-11-03T05:00:00Z"), None).is_empty());
        assert!(store.read(Some("2025-11-03T06:00:00Z"), None).is_empty());
        // Missing root directory entirely.
        let empty = SnapshotStore::new(dir.path().join("nowhere"));
        assert!(empty.read(None, None).is_empty());
    }

    #[test]
    fn test_read_latest_uses_parsed_timestamps() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        // Lexically later name but chronologically earlier instant.
        write_snapshot(
            dir.path(),
            "2025-11-03T23:00:00+09:00",
            &json!([entity_events("sensor.older", "1")]),
        );
        write_snapshot(
            dir.path(),
            "2025-11-03T15:00:00Z",
            &json!([entity_events("sensor.newer", "2")]),
        );
        write_snapshot(dir.path(), "not-a-timestamp", &json!([entity_events("x", "3")]));

        let items = store.read(None, None);
        assert_eq!(items[0][0]["entity_id"], "sensor.newer");
    }

    #[test]
    fn test_read_applies_entity_filter_on_first_event() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        write_snapshot(
            dir.path(),
            "2025-11-03T05:00:00Z",
            &json!([
                entity_events("sensor.keep", "on"),
                entity_events("sensor.drop", "off"),
                [],
                "not an array",
            ]),
        );

        let filter: BTreeSet<String> = ["sensor.keep".to_owned()].into();
        let items = store.read(Some("2025-11-03T05:00:00Z"), Some(&filter));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0][0]["entity_id"], "sensor.keep");

        // Without a filter, content comes back verbatim.
        let all = store.read(Some("2025-11-03T05:00:00Z"), None);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_list_files_newest_first_with_limit() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        for hour in ["03", "05", "04"] {
            write_snapshot(
                dir.path(),
                &format!("2025-11-03T{hour}:00:00Z"),
                &json!([entity_events("sensor.a", hour)]),
            );
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let files = store.list_files(Some(2));
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].timestamp, "2025-11-03T05:00:00Z");
        assert_eq!(files[1].timestamp, "2025-11-03T04:00:00Z");
        assert!(files[0].size > 0);

        assert_eq!(store.list_files(None).len(), 3);
    }

    #[test]
    fn test_list_files_clamps_explicit_zero_to_one() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        for hour in ["03", "04"] {
            write_snapshot(
                dir.path(),
                &format!("2025-11-03T{hour}:00:00Z"),
                &json!([entity_events("sensor.a", hour)]),
            );
        }

        // An explicit zero is not "use the default": it clamps to one entry.
        let files = store.list_files(Some(0));
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].timestamp, "2025-11-03T04:00:00Z");
    }

    #[test]
    fn test_daily_sample_prefers_exact_hour_then_nearest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let now = OffsetDateTime::now_utc();
        let midnight = hour_floor(now) - Duration::hours(i64::from(now.hour()));
        let today = midnight.date();
        let yesterday = (midnight - Duration::days(1)).date();

        let name = |d: time::Date, hour: u8| {
            format!(
                "{:04}-{:02}-{:02}T{hour:02}:00:00Z",
                d.year(),
                u8::from(d.month()),
                d.day()
            )
        };

        // Today has the exact noon snapshot plus a decoy.
        write_snapshot(dir.path(), &name(today, 12), &json!([entity_events("exact", "1")]));
        write_snapshot(dir.path(), &name(today, 13), &json!([entity_events("decoy", "1")]));
        // Yesterday is equidistant at 10 and 14; the earlier hour wins.
        write_snapshot(
            dir.path(),
            &name(yesterday, 10),
            &json!([entity_events("early", "1")]),
        );
        write_snapshot(
            dir.path(),
            &name(yesterday, 14),
            &json!([entity_events("late", "1")]),
        );

        let items = store.daily_sample(7, 12);
        // Oldest day first.
        assert_eq!(items.len(), 2);
        assert_eq!(items[0][0]["entity_id"], "early");
        assert_eq!(items[1][0]["entity_id"], "exact");
    }

    #[test]
    fn test_daily_sample_skips_empty_days() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.daily_sample(7, 12).is_empty());
    }

    #[test]
    fn test_daily_sample_survives_oversized_day_count() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        assert!(store.daily_sample(u32::MAX, 12).is_empty());
    }

    #[test]
    fn test_daily_hourly_groups_and_filters() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        write_snapshot(
            dir.path(),
            "2025-11-03T05:00:00Z",
            &json!([entity_events("sensor.keep", "1"), entity_events("sensor.other", "2")]),
        );
        write_snapshot(
            dir.path(),
            "2025-11-03T09:00:00Z",
            &json!([entity_events("sensor.other", "3"), []]),
        );
        write_snapshot(
            dir.path(),
            "2025-11-04T05:00:00Z",
            &json!([entity_events("sensor.keep", "4")]),
        );

        let all = store.daily_hourly(date!(2025 - 11 - 03), None);
        assert_eq!(all.date, "2025-11-03");
        assert_eq!(all.hours.len(), 2);
        assert_eq!(all.hours["05"].len(), 2);
        // The empty inner array is dropped.
        assert_eq!(all.hours["09"].len(), 1);

        let filter: BTreeSet<String> = ["sensor.keep".to_owned()].into();
        let kept = store.daily_hourly(date!(2025 - 11 - 03), Some(&filter));
        assert_eq!(kept.hours.len(), 1);
        assert_eq!(kept.hours["05"].len(), 1);

        let other_day = store.daily_hourly(date!(2025 - 12 - 25), None);
        assert!(other_day.hours.is_empty());
    }

    #[test]
    fn test_daily_hourly_later_snapshot_wins_the_hour() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        write_snapshot(
            dir.path(),
            "2025-11-03T05:10:00Z",
            &json!([entity_events("first", "1")]),
        );
        write_snapshot(
            dir.path(),
            "2025-11-03T05:40:00Z",
            &json!([entity_events("second", "2")]),
        );

        let day = store.daily_hourly(date!(2025 - 11 - 03), None);
        assert_eq!(day.hours.len(), 1);
        assert_eq!(day.hours["05"][0][0]["entity_id"], "second");
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("snapshots");
        let store = SnapshotStore::new(&root);
        let payload = vec![entity_events("sensor.a", "20.5")];

        let path = store
            .write(datetime!(2025-11-03 05:42:10 UTC), &payload)
            .unwrap();
        assert_eq!(
            path.file_name().and_then(OsStr::to_str),
            Some("2025-11-03T05:00:00Z.json")
        );
        assert!(!temp_path(&path).exists());

        let items = store.read(Some("2025-11-03T05:00:00Z"), None);
        assert_eq!(items, payload);
    }
}
