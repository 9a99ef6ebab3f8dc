//! User configuration and on-disk layout.
//!
//! Configuration is read from `<data_dir>/config.yaml`. Every field has a
//! default, so a missing file is the same as an empty one. A few values can
//! be overridden from the environment.

use crate::adapters::credentials::ApiKeyResolver;
use crate::adapters::transport::StatusPolicy;
use crate::core::error::HeartlineError;
use crate::core::rate_limit::RateLimiter;
use crate::core::redact::SanitizeConfig;
use crate::storage::legacy::LEGACY_QUEUE_FILENAME;
use crate::storage::queue::QUEUE_FILENAME;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.heartline.dev/api/v1";
pub const CONFIG_FILENAME: &str = "config.yaml";
pub const LOG_FILENAME: &str = "heartline.log";

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "HEARTLINE_HOME";
pub const API_KEY_ENV: &str = "HEARTLINE_API_KEY";
pub const API_URL_ENV: &str = "HEARTLINE_API_URL";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid regex in {field}: {pattern}: {source}")]
    InvalidPattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl From<ConfigError> for HeartlineError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::Read { .. } => "config_unreadable",
            ConfigError::Parse { .. } => "config_invalid",
            ConfigError::InvalidPattern { .. } => "config_invalid_pattern",
        };
        let hint = match &err {
            ConfigError::InvalidPattern { field, .. } => {
                format!("Fix the regular expression under '{field}'")
            }
            _ => "Check the YAML syntax of the config file".to_string(),
        };
        Self::config(code, err.to_string(), "config:load").with_hint(hint)
    }
}

/// Where heartline keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    pub root: PathBuf,
}

impl DataDir {
    /// `$HEARTLINE_HOME`, or `~/.heartline`.
    #[must_use]
    pub fn default_dir() -> Self {
        if let Ok(dir) = env::var(HOME_ENV) {
            if !dir.is_empty() {
                return Self {
                    root: PathBuf::from(dir),
                };
            }
        }
        let root =
            dirs::home_dir().map_or_else(|| PathBuf::from(".heartline"), |h| h.join(".heartline"));
        Self { root }
    }

    #[must_use]
    pub fn with_dir(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILENAME)
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILENAME)
    }

    #[must_use]
    pub fn migration_lock_path(&self) -> PathBuf {
        self.root.join("legacy-migration.lock")
    }
}

/// `api` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub key: Option<String>,
    /// Per-path key overrides, first match wins.
    pub key_patterns: Vec<KeyPattern>,
    pub timeout_secs: u64,
    /// Statuses treated as permanent refusals.
    pub rejected_status_codes: Vec<u16>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_API_URL.to_string(),
            key: None,
            key_patterns: Vec::new(),
            timeout_secs: 30,
            rejected_status_codes: vec![400, 413, 422],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    pub pattern: String,
    pub key: String,
}

/// `sanitize` section, as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeSection {
    pub file_patterns: Vec<String>,
    pub project_patterns: Vec<String>,
    pub branch_patterns: Vec<String>,
    pub hide_project_folder: bool,
}

/// `offline` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub disabled: bool,
    /// Minimum seconds between two rate-limited resync passes. Zero
    /// disables rate limiting.
    pub rate_limit_secs: u64,
    /// Maximum queued heartbeats sent per resync pass.
    pub sync_max: usize,
    pub queue_file: Option<PathBuf>,
    pub legacy_queue_file: Option<PathBuf>,
    pub lock_timeout_ms: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            rate_limit_secs: 120,
            sync_max: 1000,
            queue_file: None,
            legacy_queue_file: None,
            lock_timeout_ms: 5000,
        }
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub sanitize: SanitizeSection,
    pub offline: OfflineConfig,
}

impl Config {
    /// Loads configuration from `path`. A missing file yields defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `HEARTLINE_API_KEY` and `HEARTLINE_API_URL`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.api.key = Some(key);
        }
        if let Some(url) = lookup(API_URL_ENV).filter(|v| !v.is_empty()) {
            self.api.url = url;
        }
    }

    /// Compiles the `sanitize` section.
    ///
    /// # Errors
    /// Returns an error naming the first invalid pattern.
    pub fn sanitize_config(&self) -> Result<SanitizeConfig, ConfigError> {
        Ok(SanitizeConfig {
            branch_patterns: compile("sanitize.branch_patterns", &self.sanitize.branch_patterns)?,
            file_patterns: compile("sanitize.file_patterns", &self.sanitize.file_patterns)?,
            project_patterns: compile(
                "sanitize.project_patterns",
                &self.sanitize.project_patterns,
            )?,
            hide_project_folder: self.sanitize.hide_project_folder,
        })
    }

    /// Builds the credential resolver from the `api` section.
    ///
    /// # Errors
    /// Returns an error if a key pattern is not a valid regex.
    pub fn credentials(&self) -> Result<ApiKeyResolver, ConfigError> {
        let overrides = self
            .api
            .key_patterns
            .iter()
            .map(|kp| {
                Regex::new(&kp.pattern)
                    .map(|re| (re, kp.key.clone()))
                    .map_err(|source| ConfigError::InvalidPattern {
                        field: "api.key_patterns",
                        pattern: kp.pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ApiKeyResolver::new(self.api.key.clone(), overrides))
    }

    #[must_use]
    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy::new(self.api.rejected_status_codes.iter().copied())
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.offline.lock_timeout_ms)
    }

    #[must_use]
    pub const fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            Duration::from_secs(self.offline.rate_limit_secs),
            self.offline.disabled,
        )
    }

    #[must_use]
    pub fn queue_path(&self, data_dir: &DataDir) -> PathBuf {
        self.offline
            .queue_file
            .clone()
            .unwrap_or_else(|| data_dir.root.join(QUEUE_FILENAME))
    }

    /// Lock held for the length of a sync pass, beside the queue file so
    /// every process sharing the queue shares the lock.
    #[must_use]
    pub fn sync_lock_path(&self, data_dir: &DataDir) -> PathBuf {
        let mut path = self.queue_path(data_dir).into_os_string();
        path.push(".sync.lock");
        PathBuf::from(path)
    }

    /// Legacy queue location; defaults to the home directory.
    #[must_use]
    pub fn legacy_queue_path(&self, data_dir: &DataDir) -> PathBuf {
        self.offline.legacy_queue_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| data_dir.root.clone())
                .join(LEGACY_QUEUE_FILENAME)
        })
    }
}

fn compile(field: &'static str, patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                field,
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}
