//! Shared record types for the hublog device-state history store.
//!
//! This crate holds the types that flow between the collector service and
//! the file-backed store:
//!
//! - [`RawDeviceState`]: a state object exactly as the controller reports it
//! - [`StateRecord`]: one full observation, stored in snapshot partitions
//! - [`HistoryEvent`]: one state change, merged into history partitions
//! - [`flatten_history`]: nested history payload to flat event list
//!
//! All timestamps are RFC 3339 UTC; [`parse_timestamp`] and
//! [`format_timestamp`] are the one place that convention lives.

pub mod error;
pub mod record;

pub use error::{ParseError, ParseResult};
pub use record::{
    HISTORY_SOURCE, HISTORY_VERSION, HistoryEvent, RawDeviceState, STATE_SOURCE, STATE_VERSION,
    StateRecord, flatten_history, format_timestamp, parse_timestamp,
};
