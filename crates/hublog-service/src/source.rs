//! Typed client for the controller REST API.
//!
//! The collector only needs two upstream calls: the full current state of
//! every entity, and the raw history payload for a time window. Both are
//! modeled by the [`StateSource`] trait so the collection loop can run
//! against [`ControllerClient`] in production and a mock in tests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use time::OffsetDateTime;

use hublog_types::{RawDeviceState, format_timestamp};

use crate::config::ControllerConfig;

/// Timeout for a full-state fetch.
const STATES_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for a history window fetch, which can be much larger.
const HISTORY_TIMEOUT: Duration = Duration::from_secs(60);

/// Error type for controller calls.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The controller is not reachable.
    #[error("Controller not reachable at {url}: {source}")]
    NotReachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The controller answered with a non-success status.
    #[error("Controller returned {status}: {message}")]
    Http { status: u16, message: String },

    /// Invalid controller URL.
    #[error("Invalid controller URL: {0}")]
    InvalidUrl(String),

    /// A window bound could not be rendered.
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] hublog_types::ParseError),

    /// A retried operation kept failing.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<SourceError>,
    },
}

/// Result type for controller calls.
pub type Result<T> = std::result::Result<T, SourceError>;

/// Something that can serve device state, current and historical.
///
/// # Example
///
/// ```ignore
/// use hublog_service::{SourceError, StateSource};
///
/// async fn count_entities<S: StateSource>(source: &S) -> Result<usize, SourceError> {
///     Ok(source.fetch_states().await?.len())
/// }
/// ```
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Current state of every entity the source knows.
    async fn fetch_states(&self) -> Result<Vec<RawDeviceState>>;

    /// Raw nested history payload for `[start, end)`, one inner array per
    /// entity. An empty `entities` slice means no entity filter.
    async fn fetch_history(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        entities: &[String],
    ) -> Result<Vec<Value>>;
}

#[async_trait]
impl<T: StateSource + ?Sized> StateSource for std::sync::Arc<T> {
    async fn fetch_states(&self) -> Result<Vec<RawDeviceState>> {
        (**self).fetch_states().await
    }

    async fn fetch_history(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        entities: &[String],
    ) -> Result<Vec<Value>> {
        (**self).fetch_history(start, end, entities).await
    }
}

/// HTTP client for the controller API.
///
/// # Example
///
/// ```no_run
/// use hublog_service::{ControllerConfig, ControllerClient, StateSource};
///
/// # async fn example() -> Result<(), hublog_service::SourceError> {
/// let config = ControllerConfig {
///     url: "http://127.0.0.1:8123".to_string(),
///     token: "llat-abc".to_string(),
/// };
/// let client = ControllerClient::new(&config)?;
/// let states = client.fetch_states().await?;
/// println!("{} entities", states.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ControllerClient {
    client: Client,
    base_url: String,
    token: String,
    minimal_response: bool,
    no_attributes: bool,
    significant_only: bool,
}

impl ControllerClient {
    /// Create a client for the configured controller.
    ///
    /// Trailing slashes on the URL are dropped; a URL that is not http(s)
    /// is rejected up front.
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        let base_url = config.url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(SourceError::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let client = Client::builder().build().map_err(SourceError::Request)?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            minimal_response: true,
            no_attributes: true,
            significant_only: true,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask for minimal history responses.
    #[must_use]
    pub fn minimal_response(mut self, enabled: bool) -> Self {
        self.minimal_response = enabled;
        self
    }

    /// Ask for history events without attributes.
    #[must_use]
    pub fn no_attributes(mut self, enabled: bool) -> Self {
        self.no_attributes = enabled;
        self
    }

    /// Ask for significant state changes only.
    #[must_use]
    pub fn significant_only(mut self, enabled: bool) -> Self {
        self.significant_only = enabled;
        self
    }
}

#[async_trait]
impl StateSource for ControllerClient {
    async fn fetch_states(&self) -> Result<Vec<RawDeviceState>> {
        let url = format!("{}/api/states", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .timeout(STATES_TIMEOUT)
            .send()
            .await
            .map_err(|e| SourceError::NotReachable { url, source: e })?;

        handle_response(response).await
    }

    async fn fetch_history(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        entities: &[String],
    ) -> Result<Vec<Value>> {
        let start_iso = format_timestamp(start)?;
        let end_iso = format_timestamp(end)?;
        let url = format!("{}/api/history/period/{}", self.base_url, start_iso);

        let mut params: Vec<(&str, String)> = vec![("end_time", end_iso)];
        if self.minimal_response {
            params.push(("minimal_response", "true".to_string()));
        }
        if self.no_attributes {
            params.push(("no_attributes", "true".to_string()));
        }
        if self.significant_only {
            params.push(("significant_changes_only", "true".to_string()));
        }
        let mut filter: Vec<&String> = entities.iter().collect();
        filter.sort();
        for entity in filter {
            params.push(("filter_entity_id", entity.clone()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&params)
            .timeout(HISTORY_TIMEOUT)
            .send()
            .await
            .map_err(|e| SourceError::NotReachable { url, source: e })?;

        handle_response(response).await
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        response.json().await.map_err(SourceError::Request)
    } else {
        let body = response.text().await.unwrap_or_default();
        let message: String = body.chars().take(200).collect();
        let message = if message.is_empty() {
            status.to_string()
        } else {
            message
        };

        Err(SourceError::Http {
            status: status.as_u16(),
            message,
        })
    }
}
