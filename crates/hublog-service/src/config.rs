//! Collector configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default history merge window length in minutes.
pub const DEFAULT_WINDOW_MINUTES: u32 = 60;
/// Longest allowed merge window (one day).
pub const MAX_WINDOW_MINUTES: u32 = 1440;
/// Default backfill lookback cap in days.
pub const DEFAULT_BACKFILL_DAYS: u32 = 9;
/// Longest allowed backfill lookback.
pub const MAX_BACKFILL_DAYS: u32 = 90;

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upstream controller connection.
    pub controller: ControllerConfig,
    /// Storage locations.
    pub storage: StorageConfig,
    /// Collection loop behavior.
    pub collector: CollectorConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Controller URL is present and http(s) when any collection is enabled
    /// - Log root path is not empty
    /// - Window and lookback sizes are within bounds
    /// - Entity ids are non-empty and unique
    ///
    /// # Example
    ///
    /// ```
    /// use hublog_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let network_required = self.collector.capture_states || self.collector.merge_history;
        errors.extend(self.controller.validate(network_required));
        errors.extend(self.storage.validate());
        errors.extend(self.collector.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Upstream controller connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller base URL (e.g., "http://127.0.0.1:8123").
    pub url: String,
    /// Long-lived access token sent as a bearer credential.
    pub token: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            token: String::new(),
        }
    }
}

impl ControllerConfig {
    /// Validate controller settings.
    ///
    /// The URL is only required when some part of the collection loop will
    /// actually call the controller.
    pub fn validate(&self, network_required: bool) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !network_required {
            return errors;
        }

        if self.url.is_empty() {
            errors.push(ValidationError {
                field: "controller.url".to_string(),
                message: "controller URL cannot be empty".to_string(),
            });
        } else if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            errors.push(ValidationError {
                field: "controller.url".to_string(),
                message: format!(
                    "invalid URL '{}': must start with http:// or https://",
                    self.url
                ),
            });
        }

        errors
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Event log root directory.
    pub log_root: PathBuf,
    /// Snapshot directory; raw window payloads are only persisted when set.
    pub snapshot_root: Option<PathBuf>,
    /// Checkpoint file location; defaults to `.checkpoint` under the log root.
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from("/var/log/hublog"),
            snapshot_root: None,
            checkpoint_path: None,
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.log_root.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.log_root".to_string(),
                message: "log root cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Collection loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Capture a full state snapshot every cycle.
    pub capture_states: bool,
    /// Merge completed history windows every cycle.
    pub merge_history: bool,
    /// History merge window length in minutes.
    pub window_minutes: u32,
    /// How many days back the catch-up pass may reach.
    pub backfill_max_days: u32,
    /// Entity ids to collect; empty means everything the controller reports.
    pub entities: Vec<String>,
    /// Ask the controller for minimal history responses.
    pub minimal_response: bool,
    /// Ask the controller to strip attributes from history events.
    pub no_attributes: bool,
    /// Ask the controller for significant changes only.
    pub significant_only: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capture_states: true,
            merge_history: true,
            window_minutes: DEFAULT_WINDOW_MINUTES,
            backfill_max_days: DEFAULT_BACKFILL_DAYS,
            entities: Vec::new(),
            minimal_response: true,
            no_attributes: true,
            significant_only: true,
        }
    }
}

impl CollectorConfig {
    /// Validate collector configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.window_minutes == 0 || self.window_minutes > MAX_WINDOW_MINUTES {
            errors.push(ValidationError {
                field: "collector.window_minutes".to_string(),
                message: format!(
                    "window of {} minutes is out of range (1-{})",
                    self.window_minutes, MAX_WINDOW_MINUTES
                ),
            });
        }

        if self.backfill_max_days == 0 || self.backfill_max_days > MAX_BACKFILL_DAYS {
            errors.push(ValidationError {
                field: "collector.backfill_max_days".to_string(),
                message: format!(
                    "lookback of {} days is out of range (1-{})",
                    self.backfill_max_days, MAX_BACKFILL_DAYS
                ),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for (i, entity) in self.entities.iter().enumerate() {
            if entity.is_empty() {
                errors.push(ValidationError {
                    field: format!("collector.entities[{}]", i),
                    message: "entity id cannot be empty".to_string(),
                });
            } else if !seen.insert(entity.as_str()) {
                errors.push(ValidationError {
                    field: format!("collector.entities[{}]", i),
                    message: format!("duplicate entity id '{}'", entity),
                });
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `controller.url` or `collector.entities[0]`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hublog")
        .join("config.toml")
}
