//! Background collection loop.
//!
//! One task drives everything: at startup it captures a fresh state
//! snapshot and merges every history window completed since the last
//! checkpoint, then it wakes at each hour boundary and repeats the pair
//! for the window that just closed.
//!
//! The checkpoint is the only loop state. It advances strictly forward
//! and only after a window's data is durably on disk, so a crash at any
//! point means at worst re-merging an already-merged window, which the
//! store makes a no-op.

use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use hublog_store::{CheckpointStore, LogStore, SnapshotStore, hour_floor};
use hublog_types::{RawDeviceState, flatten_history};

use crate::config::{CollectorConfig, Config};
use crate::retry::{RetryConfig, with_retry};
use crate::source::{SourceError, StateSource};

/// Collection cycle errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to fetch from controller: {0}")]
    Source(#[from] SourceError),
    #[error("Failed to persist: {0}")]
    Store(#[from] hublog_store::Error),
}

/// Background collector feeding the event log and snapshot store.
pub struct Collector<S> {
    source: S,
    logs: LogStore,
    snapshots: Option<SnapshotStore>,
    checkpoint: CheckpointStore,
    settings: CollectorConfig,
    retry: RetryConfig,
}

impl<S: StateSource> Collector<S> {
    /// Create a collector wired to the configured storage locations.
    pub fn new(source: S, config: &Config) -> Self {
        let logs = LogStore::new(&config.storage.log_root);
        let snapshots = config
            .storage
            .snapshot_root
            .as_ref()
            .map(|root| SnapshotStore::new(root));
        let checkpoint = match &config.storage.checkpoint_path {
            Some(path) => CheckpointStore::new(path),
            None => CheckpointStore::for_root(&config.storage.log_root),
        };

        Self {
            source,
            logs,
            snapshots,
            checkpoint,
            settings: config.collector.clone(),
            retry: RetryConfig::default(),
        }
    }

    /// Replace the retry policy used for controller calls.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Run forever: startup capture and catch-up, then one cycle per hour.
    pub async fn run(&self) {
        let now = OffsetDateTime::now_utc();

        if self.settings.capture_states
            && let Err(e) = self.capture_states(now).await
        {
            error!(error = %e, "startup state capture failed");
        }
        if self.settings.merge_history
            && let Err(e) = self.merge_pending(hour_floor(now)).await
        {
            warn!(error = %e, "startup catch-up stopped early");
        }

        loop {
            let now = OffsetDateTime::now_utc();
            let boundary = hour_floor(now) + Duration::hours(1);
            debug!(boundary = %boundary, "sleeping until next hour boundary");
            tokio::time::sleep(duration_until(boundary, now)).await;
            self.run_cycle(boundary).await;
        }
    }

    /// One boundary cycle: merge the just-completed window(s), then write
    /// the new hour's state snapshot. Failures are logged, never fatal;
    /// unmerged windows are retried from the checkpoint next cycle.
    pub async fn run_cycle(&self, boundary: OffsetDateTime) {
        if self.settings.merge_history
            && let Err(e) = self.merge_pending(boundary).await
        {
            warn!(error = %e, "history merge deferred");
        }
        if self.settings.capture_states
            && let Err(e) = self.capture_states(boundary).await
        {
            error!(error = %e, "state capture failed");
        }
    }

    /// Merge every completed window from the checkpoint up to `upper`,
    /// oldest first.
    ///
    /// The lower bound is the checkpoint, clamped to the configured
    /// lookback. Stops at the first failing window, leaving the checkpoint
    /// on the last durable one.
    pub async fn merge_pending(&self, upper: OffsetDateTime) -> Result<(), CollectorError> {
        let window = Duration::minutes(i64::from(self.settings.window_minutes));
        let floor = upper - Duration::days(i64::from(self.settings.backfill_max_days));
        let mut start = match self.checkpoint.read() {
            Some(checkpoint) if checkpoint > floor => checkpoint,
            _ => floor,
        };

        if start >= upper {
            debug!(upper = %upper, "no pending history windows");
            return Ok(());
        }

        info!(from = %start, to = %upper, "merging pending history windows");
        while start < upper {
            let end = (start + window).min(upper);
            self.merge_window(start, end).await?;
            start = end;
        }
        Ok(())
    }

    async fn merge_window(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<(), CollectorError> {
        let payload = with_retry(&self.retry, "fetch_history", || {
            self.source.fetch_history(start, end, &self.settings.entities)
        })
        .await?;

        let events = flatten_history(&payload, !self.settings.no_attributes);
        if events.is_empty() {
            warn!(window_start = %start, "window fetched no events");
        } else {
            let added = self.logs.merge_events(start, &events)?;
            debug!(window_start = %start, events = events.len(), added, "window merged");
        }

        if let Some(snapshots) = &self.snapshots
            && !payload.is_empty()
        {
            snapshots.write(start, &payload)?;
        }

        self.checkpoint.write(end)?;
        Ok(())
    }

    async fn capture_states(&self, at: OffsetDateTime) -> Result<usize, CollectorError> {
        let states = with_retry(&self.retry, "fetch_states", || self.source.fetch_states()).await?;
        let states = self.filter_entities(states);
        Ok(self.logs.write_states(&states, at)?)
    }

    fn filter_entities(&self, states: Vec<RawDeviceState>) -> Vec<RawDeviceState> {
        if self.settings.entities.is_empty() {
            return states;
        }
        states
            .into_iter()
            .filter(|state| self.settings.entities.iter().any(|e| *e == state.entity_id))
            .collect()
    }
}

fn duration_until(boundary: OffsetDateTime, now: OffsetDateTime) -> std::time::Duration {
    let wait = boundary - now;
    if wait.is_positive() {
        // Round up so the cycle starts just past the boundary.
        std::time::Duration::from_millis(wait.whole_milliseconds() as u64 + 1)
    } else {
        std::time::Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSource;
    use serde_json::{Value, json};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;
    use time::macros::datetime;

    use hublog_store::LogQuery;

    const UPPER: OffsetDateTime = datetime!(2025-11-03 12:00 UTC);

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.storage.log_root = root.join("logs");
        config.storage.snapshot_root = Some(root.join("snapshots"));
        config
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries).initial_delay(StdDuration::from_millis(1))
    }

    fn nested_payload(entity: &str, ts: &str) -> Vec<Value> {
        vec![json!([{ "entity_id": entity, "state": "on", "last_changed": ts }])]
    }

    fn collector(config: &Config) -> (Arc<MockSource>, Collector<Arc<MockSource>>) {
        let source = Arc::new(MockSource::new());
        let collector = Collector::new(Arc::clone(&source), config).retry(fast_retry(0));
        (source, collector)
    }

    fn checkpoint_at(config: &Config, ts: OffsetDateTime) {
        CheckpointStore::for_root(&config.storage.log_root)
            .write(ts)
            .unwrap();
    }

    fn read_checkpoint(config: &Config) -> Option<OffsetDateTime> {
        CheckpointStore::for_root(&config.storage.log_root).read()
    }

    #[tokio::test]
    async fn test_merge_pending_walks_windows_in_order() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let (source, collector) = collector(&config);
        source.set_history(nested_payload("sensor.a", "2025-11-03T10:15:00Z"));
        checkpoint_at(&config, UPPER - Duration::hours(2));

        collector.merge_pending(UPPER).await.unwrap();

        let windows = source.history_windows();
        assert_eq!(
            windows,
            vec![
                (UPPER - Duration::hours(2), UPPER - Duration::hours(1)),
                (UPPER - Duration::hours(1), UPPER),
            ]
        );
        assert_eq!(read_checkpoint(&config), Some(UPPER));
    }

    #[tokio::test]
    async fn test_merge_pending_caps_lookback_without_checkpoint() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.collector.backfill_max_days = 1;
        let (source, collector) = collector(&config);

        collector.merge_pending(UPPER).await.unwrap();

        let windows = source.history_windows();
        assert_eq!(windows.len(), 24);
        assert_eq!(windows[0].0, UPPER - Duration::days(1));
        assert_eq!(windows[23].1, UPPER);
        assert_eq!(read_checkpoint(&config), Some(UPPER));
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_pass_and_keeps_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let (source, collector) = collector(&config);
        let start = UPPER - Duration::hours(3);
        checkpoint_at(&config, start);
        source.fail_history(1);

        let result = collector.merge_pending(UPPER).await;
        assert!(matches!(result, Err(CollectorError::Source(_))));
        assert_eq!(source.history_windows().len(), 1);
        assert_eq!(read_checkpoint(&config), Some(start));

        // The next pass picks up exactly where the failed one stopped.
        collector.merge_pending(UPPER).await.unwrap();
        assert_eq!(read_checkpoint(&config), Some(UPPER));
        assert_eq!(source.history_windows().len(), 4);
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_fetch_failure() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let source = Arc::new(MockSource::new());
        let collector = Collector::new(Arc::clone(&source), &config).retry(fast_retry(2));
        checkpoint_at(&config, UPPER - Duration::hours(1));
        source.fail_history(1);

        collector.merge_pending(UPPER).await.unwrap();

        assert_eq!(read_checkpoint(&config), Some(UPPER));
        assert_eq!(source.history_windows().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_window_still_advances_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let (_source, collector) = collector(&config);
        checkpoint_at(&config, UPPER - Duration::hours(1));

        collector.merge_pending(UPPER).await.unwrap();

        assert_eq!(read_checkpoint(&config), Some(UPPER));
        // No events, so no partition and no snapshot were written.
        assert!(!config.storage.log_root.join("2025").exists());
        let snapshots = SnapshotStore::new(config.storage.snapshot_root.clone().unwrap());
        assert!(snapshots.list_files(None).is_empty());
    }

    #[tokio::test]
    async fn test_merge_pending_is_idempotent_after_checkpoint_rollback() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let (source, collector) = collector(&config);
        source.set_history(nested_payload("sensor.a", "2025-11-03T11:30:00Z"));
        checkpoint_at(&config, UPPER - Duration::hours(1));

        collector.merge_pending(UPPER).await.unwrap();
        let logs = LogStore::new(&config.storage.log_root);
        let query = LogQuery::new()
            .since(UPPER - Duration::hours(1))
            .until(UPPER);
        let first = logs.read_logs(&query).unwrap();
        assert_eq!(first.items.len(), 1);

        // Simulate a crash after the merge but before the checkpoint write.
        checkpoint_at(&config, UPPER - Duration::hours(1));
        collector.merge_pending(UPPER).await.unwrap();

        let second = logs.read_logs(&query).unwrap();
        assert_eq!(second.items, first.items);
    }

    #[tokio::test]
    async fn test_run_cycle_merges_window_and_captures_states() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let (source, collector) = collector(&config);
        source.set_history(nested_payload("sensor.a", "2025-11-03T11:30:00Z"));
        source.set_states(vec![
            RawDeviceState {
                entity_id: "sensor.a".to_string(),
                state: "20.5".to_string(),
                ..Default::default()
            },
            RawDeviceState {
                entity_id: "switch.b".to_string(),
                state: "off".to_string(),
                ..Default::default()
            },
        ]);
        checkpoint_at(&config, UPPER - Duration::hours(1));

        collector.run_cycle(UPPER).await;

        let logs = LogStore::new(&config.storage.log_root);
        let merged = logs
            .read_logs(
                &LogQuery::new()
                    .since(UPPER - Duration::hours(1))
                    .until(UPPER - Duration::minutes(1)),
            )
            .unwrap();
        assert_eq!(merged.items.len(), 1);
        assert_eq!(merged.items[0]["source"], "history-api");

        let captured = logs
            .read_logs(&LogQuery::new().since(UPPER).until(UPPER))
            .unwrap();
        assert_eq!(captured.items.len(), 2);
        assert_eq!(captured.items[0]["source"], "states-api");
        assert_eq!(captured.items[0]["ts"], "2025-11-03T12:00:00Z");

        // The raw window payload landed in the snapshot store.
        let snapshots = SnapshotStore::new(config.storage.snapshot_root.clone().unwrap());
        let raw = snapshots.read(Some("2025-11-03T11:00:00Z"), None);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0][0]["entity_id"], "sensor.a");
    }

    #[tokio::test]
    async fn test_entity_filter_limits_captured_states() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.collector.entities = vec!["sensor.keep".to_string()];
        config.collector.merge_history = false;
        let (source, collector) = collector(&config);
        source.set_states(vec![
            RawDeviceState {
                entity_id: "sensor.keep".to_string(),
                state: "1".to_string(),
                ..Default::default()
            },
            RawDeviceState {
                entity_id: "sensor.drop".to_string(),
                state: "2".to_string(),
                ..Default::default()
            },
        ]);

        collector.run_cycle(UPPER).await;

        let logs = LogStore::new(&config.storage.log_root);
        let page = logs
            .read_logs(&LogQuery::new().since(UPPER).until(UPPER))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["device_id"], "sensor.keep");
    }

    #[test]
    fn test_duration_until_rounds_up_and_clamps() {
        let now = datetime!(2025-11-03 11:59:59.2 UTC);
        let boundary = datetime!(2025-11-03 12:00 UTC);
        let wait = duration_until(boundary, now);
        assert!(wait >= StdDuration::from_millis(800));
        assert!(wait <= StdDuration::from_millis(810));

        assert_eq!(
            duration_until(boundary, datetime!(2025-11-03 12:00:01 UTC)),
            StdDuration::ZERO
        );
    }
}
