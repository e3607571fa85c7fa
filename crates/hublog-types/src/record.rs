//! Record types shared by the store and the collector service.
//!
//! Two record shapes flow through the system:
//!
//! - [`StateRecord`]: one full observation per device, produced when the
//!   collector captures a complete state snapshot from the controller.
//! - [`HistoryEvent`]: one state-change event, produced by flattening the
//!   controller's nested history response.
//!
//! Both serialize to single NDJSON lines with RFC 3339 UTC timestamps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::error::{ParseError, ParseResult};

/// Source tag stamped on records captured from the full-state endpoint.
pub const STATE_SOURCE: &str = "states-api";
/// Schema version for [`StateRecord`] lines.
pub const STATE_VERSION: &str = "1.0";
/// Source tag stamped on records flattened from the history endpoint.
pub const HISTORY_SOURCE: &str = "history-api";
/// Schema version for [`HistoryEvent`] lines.
pub const HISTORY_VERSION: &str = "2.0";

/// Attribute keys whose numeric values are lifted into `metrics` verbatim.
const METRIC_ATTRIBUTE_KEYS: &[&str] = &[
    "temperature",
    "humidity",
    "battery",
    "battery_level",
    "brightness",
    "voltage",
    "power",
    "current",
    "current_position",
];

/// State strings that are never interpreted as numeric readings.
const NON_NUMERIC_STATES: &[&str] = &["unavailable", "unknown", "on", "off", "open", "closed"];

/// Parse an RFC 3339 timestamp string, normalizing the result to UTC.
///
/// Accepts both `Z` and explicit numeric offsets.
///
/// # Examples
///
/// ```
/// use hublog_types::parse_timestamp;
///
/// let ts = parse_timestamp("2025-11-03T14:00:00+09:00").unwrap();
/// assert_eq!(ts.hour(), 5);
/// assert!(parse_timestamp("not a timestamp").is_err());
/// ```
pub fn parse_timestamp(s: &str) -> ParseResult<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &Rfc3339)
        .map(|dt| dt.to_offset(UtcOffset::UTC))
        .map_err(|_| ParseError::InvalidTimestamp(s.to_owned()))
}

/// Render a timestamp as RFC 3339 UTC with a `Z` suffix.
pub fn format_timestamp(ts: OffsetDateTime) -> ParseResult<String> {
    ts.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| ParseError::FormatTimestamp(e.to_string()))
}

/// One raw device state as returned by the controller's full-state endpoint.
///
/// Fields default individually so that unusual entries in a large state
/// payload never fail the whole fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDeviceState {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub last_changed: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// One full device observation, as stored in state-snapshot partitions.
///
/// Every record written in the same snapshot cycle carries the capture hour
/// as its `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub device_id: String,
    pub status: String,
    /// Numeric readings extracted from the raw state, keyed by metric name.
    pub metrics: BTreeMap<String, f64>,
    /// The raw attribute object, carried through untouched.
    pub attributes: Map<String, Value>,
    pub source: String,
    pub version: String,
}

impl StateRecord {
    /// Build a record from a raw controller state, stamped with `ts`.
    ///
    /// Metric extraction, in order:
    ///
    /// 1. numeric (or numeric-string) values of well-known attribute keys
    ///    are copied into `metrics` under the same key;
    /// 2. when the state string itself parses as a number and is not a
    ///    non-numeric marker (`on`, `off`, `unavailable`, ...), it is
    ///    recorded under a key chosen by `device_class`, falling back to
    ///    entity-id hints for `sensor.*` entities without a usable class.
    #[must_use]
    pub fn from_raw(raw: &RawDeviceState, ts: OffsetDateTime) -> Self {
        Self {
            ts: ts.to_offset(UtcOffset::UTC),
            device_id: raw.entity_id.clone(),
            status: raw.state.clone(),
            metrics: extract_metrics(&raw.entity_id, &raw.state, &raw.attributes),
            attributes: raw.attributes.clone(),
            source: STATE_SOURCE.to_owned(),
            version: STATE_VERSION.to_owned(),
        }
    }
}

/// One state-change event, as stored in history partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub device_id: String,
    pub status: String,
    /// Omitted from the serialized line when the source event carried none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
    pub source: String,
    pub version: String,
}

impl HistoryEvent {
    /// Create an event with the standard source tag and schema version.
    #[must_use]
    pub fn new(
        ts: OffsetDateTime,
        device_id: impl Into<String>,
        status: impl Into<String>,
        attributes: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            ts: ts.to_offset(UtcOffset::UTC),
            device_id: device_id.into(),
            status: status.into(),
            attributes,
            source: HISTORY_SOURCE.to_owned(),
            version: HISTORY_VERSION.to_owned(),
        }
    }
}

/// Flatten the controller's nested history payload into a flat event list.
///
/// The payload is an array of arrays: one inner array per entity, holding
/// that entity's events in upstream field names (`entity_id`, `state`,
/// `last_changed`, `last_updated`, `attributes`). Entries missing an entity
/// id, a state, or a parsable timestamp are dropped. Each event's timestamp
/// is re-normalized to UTC.
///
/// With `include_attributes` unset (the usual case when the fetch itself
/// requested no attributes), attribute objects are discarded; empty
/// attribute objects are treated as absent either way.
///
/// # Examples
///
/// ```
/// use hublog_types::flatten_history;
/// use serde_json::json;
///
/// let payload = vec![json!([
///     {"entity_id": "sensor.kitchen", "state": "21.5",
///      "last_changed": "2025-11-03T04:10:00+00:00"},
///     {"state": "22.0", "last_changed": "2025-11-03T04:40:00+00:00"}
/// ])];
/// let events = flatten_history(&payload, false);
/// assert_eq!(events.len(), 1);
/// assert_eq!(events[0].device_id, "sensor.kitchen");
/// ```
#[must_use]
pub fn flatten_history(raw: &[Value], include_attributes: bool) -> Vec<HistoryEvent> {
    let mut events = Vec::new();
    for entity_events in raw {
        let Some(list) = entity_events.as_array() else {
            continue;
        };
        for ev in list {
            let Some(obj) = ev.as_object() else {
                continue;
            };
            let Some(device_id) = non_empty_str(obj.get("entity_id")) else {
                continue;
            };
            let Some(status) = non_empty_str(obj.get("state")) else {
                continue;
            };
            let Some(raw_ts) =
                non_empty_str(obj.get("last_changed")).or_else(|| non_empty_str(obj.get("last_updated")))
            else {
                continue;
            };
            let Ok(ts) = parse_timestamp(raw_ts) else {
                continue;
            };
            let attributes = if include_attributes {
                obj.get("attributes")
                    .and_then(Value::as_object)
                    .filter(|m| !m.is_empty())
                    .cloned()
            } else {
                None
            };
            events.push(HistoryEvent::new(ts, device_id, status, attributes));
        }
    }
    events
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn numeric_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn extract_metrics(
    entity_id: &str,
    state: &str,
    attributes: &Map<String, Value>,
) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();

    for key in METRIC_ATTRIBUTE_KEYS {
        if let Some(value) = attributes.get(*key).and_then(numeric_value) {
            metrics.insert((*key).to_owned(), value);
        }
    }

    if state.is_empty() || NON_NUMERIC_STATES.contains(&state) {
        return metrics;
    }
    let Some(value) = state.trim().parse::<f64>().ok().filter(|v| v.is_finite()) else {
        return metrics;
    };

    let device_class = attributes
        .get("device_class")
        .and_then(Value::as_str)
        .unwrap_or("");
    match device_class {
        "temperature" => {
            metrics.insert("temperature".to_owned(), value);
        }
        "humidity" => {
            metrics.insert("humidity".to_owned(), value);
        }
        // Lux sensors report their reading under the brightness key.
        "illuminance" => {
            metrics.insert("brightness".to_owned(), value);
        }
        "current" | "voltage" | "power" | "energy" => {
            metrics.insert(device_class.to_owned(), value);
        }
        _ => {
            // Sensors without a usable device_class: guess from the entity id.
            if entity_id.starts_with("sensor.") {
                let id = entity_id.to_lowercase();
                if id.contains("temp") || id.contains("ondo") {
                    metrics.insert("temperature".to_owned(), value);
                } else if id.contains("humid") || id.contains("seubdo") {
                    metrics.insert("humidity".to_owned(), value);
                } else if id.contains("bright") || id.contains("jodo") {
                    metrics.insert("brightness".to_owned(), value);
                }
            }
        }
    }

    metrics
}
