//! Structured error types.
//!
//! Errors must be classifiable, attributable, and actionable.
//! Every error answers: What failed? Why? What can be done next?

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// System-level errors (IO, environment)
    System,
    /// Configuration file or flag errors
    Config,
    /// Offline queue store errors
    Store,
    /// Delivery to the ingestion endpoint failed
    Transport,
    /// Legacy queue migration errors
    Migration,
    /// User input errors
    User,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Config => write!(f, "config"),
            Self::Store => write!(f, "store"),
            Self::Transport => write!(f, "transport"),
            Self::Migration => write!(f, "migration"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Structured error with full context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartlineError {
    /// Error category for classification.
    pub category: ErrorCategory,
    /// Unique error code within category.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Component that originated the error.
    pub origin: String,
    /// Whether a later invocation may succeed without user action.
    pub recoverable: bool,
    /// Hint for recovery action.
    pub recovery_hint: Option<String>,
    /// Additional context key-value pairs.
    pub context: HashMap<String, String>,
}

impl HeartlineError {
    /// Creates a new error with the given parameters.
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            origin: origin.into(),
            recoverable: false,
            recovery_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets whether the error is recoverable.
    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Sets the recovery hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Creates a system error.
    #[must_use]
    pub fn system(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::System, code, message, origin)
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Config, code, message, origin)
    }

    /// Creates a queue store error. Lock contention is the common cause, so
    /// these are recoverable by default.
    #[must_use]
    pub fn store(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Store, code, message, origin).recoverable(true)
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Transport, code, message, origin).recoverable(true)
    }

    /// Creates a legacy migration error.
    #[must_use]
    pub fn migration(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Migration, code, message, origin).recoverable(true)
    }

    /// Creates a user input error.
    #[must_use]
    pub fn user(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::User, code, message, origin).recoverable(true)
    }
}

impl std::fmt::Display for HeartlineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for HeartlineError {}

/// Result type using `HeartlineError`.
pub type Result<T> = std::result::Result<T, HeartlineError>;

/// Exit codes for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    /// Live delivery failed; the heartbeat was saved to the offline queue.
    Queued = 102,
    ConfigInvalid = 103,
    /// The remote refused the credential; the heartbeat was saved offline.
    Auth = 104,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = HeartlineError::store("open_failed", "Failed to open queue", "storage:queue");
        assert!(err.to_string().contains("store"));
        assert!(err.to_string().contains("open_failed"));
        assert!(err.recoverable);
    }

    #[test]
    fn error_with_context() {
        let err = HeartlineError::config("invalid_pattern", "Bad regex", "config:sanitize")
            .with_context("pattern", "([")
            .with_hint("Fix the pattern in config.yaml");

        assert_eq!(err.context.get("pattern"), Some(&"([".to_string()));
        assert!(err.recovery_hint.is_some());
        assert!(!err.recoverable);
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::Queued), 102);
        assert_eq!(i32::from(ExitCode::ConfigInvalid), 103);
    }
}
