//! Retry logic for controller calls.
//!
//! Upstream fetches fail transiently: the controller restarts, a proxy
//! times out, a history query runs long. This module provides bounded
//! retry with exponential backoff for those cases, while client mistakes
//! (4xx, bad URLs) fail immediately.
//!
//! # Example
//!
//! ```ignore
//! use hublog_service::{RetryConfig, with_retry};
//!
//! let config = RetryConfig::default();
//! let states = with_retry(&config, "fetch_states", || client.fetch_states()).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::source::{Result, SourceError};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means no retries).
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries (for exponential backoff).
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Calculate delay for a given attempt number.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Up to 25% extra to spread out synchronized clients.
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Execute an async operation with retry logic.
///
/// Retries only errors classified transient. When the allowed attempts run
/// out the last error is returned wrapped in
/// [`SourceError::RetriesExhausted`]; non-retryable errors come back
/// unwrapped on the first failure.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                if attempt >= config.max_retries {
                    return Err(SourceError::RetriesExhausted {
                        operation: operation_name.to_string(),
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Check if an error is retryable.
fn is_retryable(error: &SourceError) -> bool {
    match error {
        // The controller may just be restarting.
        SourceError::NotReachable { .. } => true,
        // Transport failures are transient; decode failures are not.
        SourceError::Request(e) => !e.is_decode(),
        // Server-side trouble and throttling pass, client mistakes fail.
        SourceError::Http { status, .. } => *status >= 500 || *status == 429,
        SourceError::InvalidUrl(_) => false,
        SourceError::Timestamp(_) => false,
        SourceError::RetriesExhausted { .. } => false,
    }
}
