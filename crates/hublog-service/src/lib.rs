//! Background collector turning a home controller's state history into
//! hour-partitioned NDJSON logs.
//!
//! This crate provides a service that:
//! - Captures a full device-state snapshot at startup and every hour
//! - Merges completed history windows into the append-only event log
//! - Tracks progress in a checkpoint so restarts resume, not re-fetch
//! - Optionally archives raw history payloads as JSON snapshots
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/hublog/config.toml`:
//!
//! ```toml
//! [controller]
//! url = "http://127.0.0.1:8123"
//! token = "your-long-lived-access-token"
//!
//! [storage]
//! log_root = "/var/log/hublog"
//! snapshot_root = "/var/log/hublog-raw"
//!
//! [collector]
//! window_minutes = 60
//! backfill_max_days = 9
//! entities = ["sensor.living_room_temp", "switch.heater"]
//! ```
//!
//! An empty `entities` list collects every entity the controller reports.

pub mod collector;
pub mod config;
pub mod mock;
pub mod retry;
pub mod source;

pub use collector::{Collector, CollectorError};
pub use config::{
    CollectorConfig, Config, ConfigError, ControllerConfig, StorageConfig, ValidationError,
};
pub use mock::MockSource;
pub use retry::{RetryConfig, with_retry};
pub use source::{ControllerClient, SourceError, StateSource};
