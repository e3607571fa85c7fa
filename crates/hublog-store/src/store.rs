//! Write paths for the event log: snapshot overwrites and history merges.
//!
//! Both operations share one durability discipline: the new partition
//! content is fully written to a sibling `.part` file, flushed and synced,
//! then renamed onto the final path. A concurrent reader sees either the
//! complete old partition or the complete new one, never a torn file, which
//! is what lets the query side run without any locking.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use hublog_types::{HistoryEvent, RawDeviceState, StateRecord, format_timestamp};

use crate::error::{Error, Result};
use crate::layout::{hour_floor, partition_path, temp_path};

/// Hour-partitioned NDJSON event log rooted at one directory.
///
/// The handle is plain data; every operation re-derives paths from the root,
/// so clones can be handed to concurrent readers freely.
#[derive(Debug, Clone)]
pub struct LogStore {
    root: PathBuf,
}

/// Merge-time dedup only looks at these two fields of an existing line.
#[derive(Deserialize)]
struct LineKey {
    device_id: String,
    ts: String,
}

impl LogStore {
    /// Create a store rooted at `root`.
    ///
    /// The directory does not have to exist yet; partitions create their
    /// parents on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory this store operates under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the partition covering `ts`.
    #[must_use]
    pub fn partition_path(&self, ts: OffsetDateTime) -> PathBuf {
        partition_path(&self.root, ts)
    }

    // === Snapshot writes ===

    /// Overwrite the partition for `hour` with one record per device state.
    ///
    /// Every record is stamped with the hour floor of `hour`, so a snapshot
    /// partition holds a uniform capture timestamp. States missing an entity
    /// id or a state string are dropped. Returns the number of records
    /// written. When nothing remains to write, no file is touched and any
    /// existing partition is left alone.
    pub fn write_states(&self, states: &[RawDeviceState], hour: OffsetDateTime) -> Result<usize> {
        let hour = hour_floor(hour);
        let mut lines = Vec::with_capacity(states.len());
        for raw in states {
            if raw.entity_id.is_empty() || raw.state.is_empty() {
                continue;
            }
            lines.push(serde_json::to_string(&StateRecord::from_raw(raw, hour))?);
        }
        if lines.is_empty() {
            warn!("no device states to persist, skipping snapshot write");
            return Ok(0);
        }

        let final_path = self.partition_path(hour);
        self.replace_partition(&final_path, &lines)?;
        info!(
            path = %final_path.display(),
            records = lines.len(),
            "state snapshot written"
        );
        Ok(lines.len())
    }

    // === History merges ===

    /// Merge events into the partition covering `window_start`.
    ///
    /// Existing lines are preserved line-for-line, including ones that do
    /// not parse; an event is appended only when no line so far carries its
    /// `(device_id, ts)` pair. Returns the number of events actually added,
    /// so re-merging an already-covered window reports 0.
    pub fn merge_events(
        &self,
        window_start: OffsetDateTime,
        events: &[HistoryEvent],
    ) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let final_path = self.partition_path(window_start);
        let (mut lines, mut seen) = load_existing(&final_path)?;

        let mut added = 0usize;
        for event in events {
            let key = (event.device_id.clone(), format_timestamp(event.ts)?);
            if seen.contains(&key) {
                continue;
            }
            lines.push(serde_json::to_string(event)?);
            seen.insert(key);
            added += 1;
        }

        self.replace_partition(&final_path, &lines)?;
        info!(
            path = %final_path.display(),
            added,
            total = lines.len(),
            "history window merged"
        );
        Ok(added)
    }

    /// Stage `lines` in a sibling temp file, then rename onto `final_path`.
    ///
    /// On any failure the temp file is removed and the final path is left
    /// exactly as it was.
    fn replace_partition(&self, final_path: &Path, lines: &[String]) -> Result<()> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let tmp = temp_path(final_path);
        let result = write_lines(&tmp, lines)
            .and_then(|()| fs::rename(&tmp, final_path).map_err(Error::from));
        if result.is_err() {
            debug!(path = %tmp.display(), "removing stale temp file");
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

/// Read a partition's lines plus the dedup keys of its parsable lines.
///
/// A missing file is an empty partition. Lines that fail to parse stay in
/// the line list but contribute no key.
fn load_existing(path: &Path) -> Result<(Vec<String>, HashSet<(String, String)>)> {
    let mut lines = Vec::new();
    let mut seen = HashSet::new();
    match File::open(path) {
        Ok(file) => {
            for line in BufReader::new(file).lines() {
                let line = line?;
                if let Ok(key) = serde_json::from_str::<LineKey>(&line) {
                    seen.insert((key.device_id, key.ts));
                }
                lines.push(line);
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok((lines, seen))
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use time::macros::datetime;

    fn raw_state(entity_id: &str, state: &str) -> RawDeviceState {
        RawDeviceState {
            entity_id: entity_id.to_owned(),
            state: state.to_owned(),
            ..Default::default()
        }
    }

    fn event(device_id: &str, ts: OffsetDateTime, status: &str) -> HistoryEvent {
        HistoryEvent::new(ts, device_id, status, None)
    }

    fn partition_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn test_write_states_creates_partition_with_stamped_hour() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let states = vec![raw_state("sensor.a", "1"), raw_state("sensor.b", "on")];

        let written = store
            .write_states(&states, datetime!(2025-11-03 05:47 UTC))
            .unwrap();
        assert_eq!(written, 2);

        let path = store.partition_path(datetime!(2025-11-03 05:00 UTC));
        let lines = partition_lines(&path);
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let record: StateRecord = serde_json::from_str(line).unwrap();
            assert_eq!(record.ts, datetime!(2025-11-03 05:00 UTC));
        }
    }

    #[test]
    fn test_write_states_empty_input_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());

        assert_eq!(store.write_states(&[], datetime!(2025-11-03 05:00 UTC)).unwrap(), 0);
        assert!(!store.partition_path(datetime!(2025-11-03 05:00 UTC)).exists());
    }

    #[test]
    fn test_write_states_drops_incomplete_entries() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let hour = datetime!(2025-11-03 05:00 UTC);
        let states = vec![raw_state("sensor.a", "1"), raw_state("", "2"), raw_state("sensor.c", "")];

        assert_eq!(store.write_states(&states, hour).unwrap(), 1);
        let lines = partition_lines(&store.partition_path(hour));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"device_id\":\"sensor.a\""));

        // An all-invalid batch must not clobber the existing partition.
        assert_eq!(store.write_states(&[raw_state("", "x")], hour).unwrap(), 0);
        assert_eq!(partition_lines(&store.partition_path(hour)).len(), 1);
    }

    #[test]
    fn test_write_states_overwrites_previous_snapshot() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let hour = datetime!(2025-11-03 05:00 UTC);

        store
            .write_states(&[raw_state("a", "1"), raw_state("b", "2")], hour)
            .unwrap();
        store.write_states(&[raw_state("c", "3")], hour).unwrap();

        let lines = partition_lines(&store.partition_path(hour));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"device_id\":\"c\""));
    }

    #[test]
    fn test_write_failure_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let hour = datetime!(2025-11-03 05:00 UTC);

        // Occupy the day directory with a plain file so create_dir_all fails.
        fs::create_dir_all(dir.path().join("2025/11")).unwrap();
        fs::write(dir.path().join("2025/11/03"), b"blocker").unwrap();

        let err = store.write_states(&[raw_state("a", "1")], hour).unwrap_err();
        assert!(matches!(err, Error::CreateDirectory { .. } | Error::Io(_)));
        assert!(!store.partition_path(hour).exists());
        assert!(!temp_path(&store.partition_path(hour)).exists());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let start = datetime!(2025-11-03 04:00 UTC);
        let events = vec![
            event("sensor.a", datetime!(2025-11-03 04:10 UTC), "1"),
            event("sensor.b", datetime!(2025-11-03 04:20 UTC), "2"),
        ];

        assert_eq!(store.merge_events(start, &events).unwrap(), 2);
        let first = partition_lines(&store.partition_path(start));

        assert_eq!(store.merge_events(start, &events).unwrap(), 0);
        let second = partition_lines(&store.partition_path(start));
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_appends_only_new_keys() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let start = datetime!(2025-11-03 04:00 UTC);

        store
            .merge_events(start, &[event("sensor.a", datetime!(2025-11-03 04:10 UTC), "1")])
            .unwrap();

        // Same device later in the hour is a new key; the duplicate is not.
        let added = store
            .merge_events(
                start,
                &[
                    event("sensor.a", datetime!(2025-11-03 04:10 UTC), "1"),
                    event("sensor.a", datetime!(2025-11-03 04:40 UTC), "3"),
                ],
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(partition_lines(&store.partition_path(start)).len(), 2);
    }

    #[test]
    fn test_merge_dedups_within_one_batch() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let start = datetime!(2025-11-03 04:00 UTC);
        let ts = datetime!(2025-11-03 04:10 UTC);

        let added = store
            .merge_events(start, &[event("sensor.a", ts, "1"), event("sensor.a", ts, "1")])
            .unwrap();
        assert_eq!(added, 1);
    }

    #[test]
    fn test_merge_preserves_unparsable_lines() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let start = datetime!(2025-11-03 04:00 UTC);
        let path = store.partition_path(start);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "this is not json\n").unwrap();

        store
            .merge_events(start, &[event("sensor.a", datetime!(2025-11-03 04:10 UTC), "1")])
            .unwrap();

        let lines = partition_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "this is not json");
    }

    #[test]
    fn test_merge_keys_survive_mixed_record_shapes() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let hour = datetime!(2025-11-03 04:00 UTC);

        // A snapshot partition already holds a record for this device+hour.
        store.write_states(&[raw_state("sensor.a", "1")], hour).unwrap();

        let added = store
            .merge_events(
                hour,
                &[event("sensor.a", hour, "1"), event("sensor.a", datetime!(2025-11-03 04:30 UTC), "2")],
            )
            .unwrap();
        assert_eq!(added, 1, "the snapshot line at the exact hour should block its duplicate");
    }

    #[test]
    fn test_state_record_metric_extraction_flows_into_partition() {
        let dir = tempdir().unwrap();
        let store = LogStore::new(dir.path());
        let hour = datetime!(2025-11-03 05:00 UTC);
        let mut raw = raw_state("sensor.kitchen_temp", "21.5");
        raw.attributes = json!({"battery": 88}).as_object().cloned().unwrap();

        store.write_states(&[raw], hour).unwrap();

        let lines = partition_lines(&store.partition_path(hour));
        let record: StateRecord = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record.metrics.get("temperature"), Some(&21.5));
        assert_eq!(record.metrics.get("battery"), Some(&88.0));
    }
}
