//! API key selection.
//!
//! Users can route heartbeats for some paths to a different account by
//! mapping entity patterns to keys. The first matching pattern wins.

use crate::core::heartbeat::Heartbeat;
use regex::Regex;

/// Chooses the credential attached to a heartbeat.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyResolver {
    default_key: Option<String>,
    overrides: Vec<(Regex, String)>,
}

impl ApiKeyResolver {
    #[must_use]
    pub fn new(default_key: Option<String>, overrides: Vec<(Regex, String)>) -> Self {
        Self {
            default_key: default_key.filter(|k| !k.trim().is_empty()),
            overrides,
        }
    }

    #[must_use]
    pub fn has_default(&self) -> bool {
        self.default_key.is_some()
    }

    /// Key for `heartbeat`, or `None` if no key is configured for it.
    #[must_use]
    pub fn key_for(&self, heartbeat: &Heartbeat) -> Option<&str> {
        self.overrides
            .iter()
            .find(|(pattern, _)| pattern.is_match(&heartbeat.entity))
            .map(|(_, key)| key.as_str())
            .or(self.default_key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_beats_default() {
        let resolver = ApiKeyResolver::new(
            Some("default".to_string()),
            vec![(Regex::new("^/work/").unwrap(), "work".to_string())],
        );
        assert_eq!(
            resolver.key_for(&Heartbeat::new("/work/app.rs", 1.0)),
            Some("work")
        );
        assert_eq!(
            resolver.key_for(&Heartbeat::new("/home/me/x.rs", 1.0)),
            Some("default")
        );
    }

    #[test]
    fn blank_default_is_no_key() {
        let resolver = ApiKeyResolver::new(Some("  ".to_string()), Vec::new());
        assert!(!resolver.has_default());
        assert_eq!(resolver.key_for(&Heartbeat::new("/x.rs", 1.0)), None);
    }
}
