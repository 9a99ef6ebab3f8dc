//! Heartbeat definitions and identity.
//!
//! A heartbeat is one recorded activity observation emitted by an editor
//! plugin. Heartbeats are mutable while they travel through the pipeline and
//! frozen once they reach the delivery sink.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Kind of entity a heartbeat refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    File,
    App,
    Domain,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::App => write!(f, "app"),
            Self::Domain => write!(f, "domain"),
        }
    }
}

/// Activity category of a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Coding,
    Building,
    Debugging,
    Browsing,
    CodeReviewing,
    Designing,
    Indexing,
    Learning,
    ManualTesting,
    Meeting,
    Planning,
    Researching,
    RunningTests,
    WritingDocs,
    WritingTests,
    Communicating,
    Translating,
    Supporting,
    AiCoding,
}

impl Category {
    pub const ALL: [Self; 19] = [
        Self::Coding,
        Self::Building,
        Self::Debugging,
        Self::Browsing,
        Self::CodeReviewing,
        Self::Designing,
        Self::Indexing,
        Self::Learning,
        Self::ManualTesting,
        Self::Meeting,
        Self::Planning,
        Self::Researching,
        Self::RunningTests,
        Self::WritingDocs,
        Self::WritingTests,
        Self::Communicating,
        Self::Translating,
        Self::Supporting,
        Self::AiCoding,
    ];

    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Building => "building",
            Self::Debugging => "debugging",
            Self::Browsing => "browsing",
            Self::CodeReviewing => "code_reviewing",
            Self::Designing => "designing",
            Self::Indexing => "indexing",
            Self::Learning => "learning",
            Self::ManualTesting => "manual_testing",
            Self::Meeting => "meeting",
            Self::Planning => "planning",
            Self::Researching => "researching",
            Self::RunningTests => "running_tests",
            Self::WritingDocs => "writing_docs",
            Self::WritingTests => "writing_tests",
            Self::Communicating => "communicating",
            Self::Translating => "translating",
            Self::Supporting => "supporting",
            Self::AiCoding => "ai_coding",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    /// Accepts wire names as well as `code reviewing` / `code-reviewing`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "app" => Ok(Self::App),
            "domain" => Ok(Self::Domain),
            _ => Err(format!("unknown entity type '{s}'")),
        }
    }
}

/// Deterministic identity of a logical observation.
///
/// Derived from time, entity, category, project and write flag. Two
/// heartbeats with the same key must never be delivered as two remote
/// records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wraps a key read back from storage.
    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One activity observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Seconds since the Unix epoch, sub-second precision.
    pub time: f64,
    pub entity: String,
    #[serde(rename = "type", default)]
    pub entity_type: EntityKind,
    #[serde(default)]
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Absolute path of the project root, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
    /// Number of path segments making up the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, rename = "cursorpos", skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<u32>,
    #[serde(default, rename = "lineno", skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    /// Set for synthetic heartbeats about buffers that were never saved.
    #[serde(default)]
    pub is_unsaved_entity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Credential chosen for this heartbeat before redaction. Kept in the
    /// offline queue, never sent in the request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Heartbeat {
    /// Creates a file heartbeat with the given entity and time.
    #[must_use]
    pub fn new(entity: impl Into<String>, time: f64) -> Self {
        Self {
            time,
            entity: entity.into(),
            entity_type: EntityKind::File,
            category: Category::Coding,
            project: None,
            project_root: None,
            project_root_count: None,
            branch: None,
            is_write: false,
            language: None,
            cursor_position: None,
            line_number: None,
            lines: None,
            dependencies: None,
            is_unsaved_entity: false,
            user_agent: None,
            api_key: None,
        }
    }

    /// Computes the idempotency key of this heartbeat.
    ///
    /// Fields are joined with `-`. Project and entity escape `\` and `-`, so
    /// distinct field values never join into the same key.
    #[must_use]
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey(format!(
            "{:.6}-{}-{}-{}-{}",
            self.time,
            self.category,
            escape_key_field(self.project.as_deref().unwrap_or_default()),
            escape_key_field(&self.entity),
            self.is_write
        ))
    }

    /// Returns true when the entity is a `scheme://host` address, such as
    /// an ssh/sftp file or a URL.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        remote_address_regex().is_match(&self.entity)
    }

    /// Copy without the routing credential, for the wire and for display.
    #[must_use]
    pub fn without_api_key(&self) -> Self {
        Self {
            api_key: None,
            ..self.clone()
        }
    }
}

fn escape_key_field(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains(['\\', '-']) {
        field.replace('\\', "\\\\").replace('-', "\\-").into()
    } else {
        field.into()
    }
}

/// Matches `scheme://[user[:pass]@]host[:port]`, capturing the credentials.
pub(crate) fn remote_address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z][A-Za-z0-9+.\-]*://(?P<credentials>[^:@/]+(?::[^@/]*)?@)?[^:/@]+(?::\d+)?",
        )
        .expect("remote address regex is valid")
    })
}
