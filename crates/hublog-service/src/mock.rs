//! Mock state source for testing.
//!
//! [`MockSource`] implements [`StateSource`] with canned data, so collector
//! logic can be exercised without a running controller. The next `n` calls
//! of either operation can be made to fail with a retryable HTTP 503 to
//! simulate an upstream outage.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use hublog_types::RawDeviceState;

use crate::source::{Result, SourceError, StateSource};

/// A controller stand-in returning canned data.
///
/// # Example
///
/// ```
/// use hublog_service::{MockSource, StateSource};
///
/// #[tokio::main]
/// async fn main() {
///     let source = MockSource::new();
///     source.fail_states(1);
///     assert!(source.fetch_states().await.is_err());
///     assert!(source.fetch_states().await.unwrap().is_empty());
/// }
/// ```
#[derive(Debug, Default)]
pub struct MockSource {
    states: Mutex<Vec<RawDeviceState>>,
    history: Mutex<Vec<Value>>,
    states_failures: AtomicU32,
    history_failures: AtomicU32,
    states_calls: AtomicU32,
    history_calls: Mutex<Vec<(OffsetDateTime, OffsetDateTime)>>,
}

impl MockSource {
    /// Create an empty mock source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the canned full-state answer.
    pub fn set_states(&self, states: Vec<RawDeviceState>) {
        *lock(&self.states) = states;
    }

    /// Replace the canned history payload, served for every window.
    pub fn set_history(&self, payload: Vec<Value>) {
        *lock(&self.history) = payload;
    }

    /// Make the next `count` state fetches fail.
    pub fn fail_states(&self, count: u32) {
        self.states_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` history fetches fail.
    pub fn fail_history(&self, count: u32) {
        self.history_failures.store(count, Ordering::SeqCst);
    }

    /// How many state fetches were attempted.
    pub fn states_calls(&self) -> u32 {
        self.states_calls.load(Ordering::SeqCst)
    }

    /// Every history window requested so far, failures included.
    pub fn history_windows(&self) -> Vec<(OffsetDateTime, OffsetDateTime)> {
        lock(&self.history_calls).clone()
    }
}

#[async_trait]
impl StateSource for MockSource {
    async fn fetch_states(&self) -> Result<Vec<RawDeviceState>> {
        self.states_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.states_failures) {
            return Err(unavailable());
        }
        Ok(lock(&self.states).clone())
    }

    async fn fetch_history(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        _entities: &[String],
    ) -> Result<Vec<Value>> {
        lock(&self.history_calls).push((start, end));
        if take_failure(&self.history_failures) {
            return Err(unavailable());
        }
        Ok(lock(&self.history).clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn unavailable() -> SourceError {
    SourceError::Http {
        status: 503,
        message: "mock failure".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let source = MockSource::new();
        source.fail_history(2);

        let start = datetime!(2025-11-03 04:00 UTC);
        let end = datetime!(2025-11-03 05:00 UTC);

        assert!(source.fetch_history(start, end, &[]).await.is_err());
        assert!(source.fetch_history(start, end, &[]).await.is_err());
        assert!(source.fetch_history(start, end, &[]).await.is_ok());
        assert_eq!(source.history_windows().len(), 3);
    }

    #[tokio::test]
    async fn test_canned_states_round_trip() {
        let source = MockSource::new();
        source.set_states(vec![RawDeviceState {
            entity_id: "sensor.a".to_string(),
            state: "20.5".to_string(),
            ..Default::default()
        }]);

        let states = source.fetch_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].entity_id, "sensor.a");
        assert_eq!(source.states_calls(), 1);
    }
}
