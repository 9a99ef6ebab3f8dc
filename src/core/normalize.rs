//! Entity path normalization.
//!
//! Runs first in the live pipeline so that redaction and deduplication see
//! canonical paths.

use crate::adapters::classify::Classifier;
use crate::core::heartbeat::{EntityKind, Heartbeat};
use crate::core::pipeline::{Next, Outcome, PipelineContext, PipelineError, Stage};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PLAYGROUND_SUFFIXES: [&str; 3] = [".playground", ".xcplayground", ".xcplaygroundpage"];

/// Normalizes file entities and fills in classification.
#[derive(Clone, Default)]
pub struct NormalizationStage {
    classifier: Option<Arc<dyn Classifier>>,
    base_dir: Option<PathBuf>,
}

impl NormalizationStage {
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            classifier: Some(classifier),
            base_dir: None,
        }
    }

    /// Resolves relative entities against `dir` instead of the working
    /// directory.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn normalize(&self, heartbeat: &mut Heartbeat) {
        if heartbeat.entity_type != EntityKind::File || heartbeat.is_remote() {
            return;
        }

        heartbeat.entity = normalize_path(&heartbeat.entity, self.base_dir.as_deref());

        let path = Path::new(&heartbeat.entity);
        if path.is_dir() {
            if PLAYGROUND_SUFFIXES.iter().any(|s| heartbeat.entity.ends_with(s)) {
                heartbeat.entity = join_entity(&heartbeat.entity, "Contents.swift");
            } else if heartbeat.entity.ends_with(".xcodeproj") {
                heartbeat.entity = join_entity(&heartbeat.entity, "project.pbxproj");
            }
        }

        if let Some(classifier) = &self.classifier {
            if heartbeat.language.is_some()
                && heartbeat.project.is_some()
                && heartbeat.project_root.is_some()
            {
                return;
            }
            let classification = classifier.classify(Path::new(&heartbeat.entity));
            if heartbeat.language.is_none() {
                heartbeat.language = classification.language;
            }
            if heartbeat.project.is_none() {
                heartbeat.project = classification.project;
            }
            if heartbeat.project_root.is_none() {
                if let Some(root) = classification.project_root {
                    heartbeat.project_root_count = Some(segment_count(&root));
                    heartbeat.project_root = Some(root);
                }
            }
        }
    }
}

impl Stage for NormalizationStage {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn process(
        &self,
        ctx: &PipelineContext,
        mut heartbeats: Vec<Heartbeat>,
        next: Next<'_>,
    ) -> Result<Vec<Outcome>, PipelineError> {
        tracing::debug!(parent: ctx.span(), "execute entity normalization");
        for heartbeat in &mut heartbeats {
            self.normalize(heartbeat);
        }
        next.run(ctx, heartbeats)
    }
}

/// Expands `~`, converts Windows separators and makes the path absolute.
#[must_use]
pub fn normalize_path(entity: &str, base_dir: Option<&Path>) -> String {
    let mut entity = entity.trim().replace('\\', "/");

    if entity == "~" || entity.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            entity = format!("{}{}", home.to_string_lossy(), &entity[1..]);
        }
    }

    if is_windows_drive_path(&entity) {
        // Drive letters are always uppercase.
        let mut chars = entity.chars();
        if let Some(drive) = chars.next() {
            entity = format!("{}{}", drive.to_ascii_uppercase(), chars.as_str());
        }
        return entity;
    }

    if !entity.starts_with('/') && !entity.is_empty() {
        let base = base_dir
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok());
        if let Some(base) = base {
            entity = base.join(&entity).to_string_lossy().replace('\\', "/");
        }
    }

    entity
}

fn is_windows_drive_path(entity: &str) -> bool {
    let bytes = entity.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

fn join_entity(dir: &str, file: &str) -> String {
    format!("{}/{file}", dir.trim_end_matches('/'))
}

fn segment_count(root: &str) -> u32 {
    let count = root.split('/').filter(|s| !s.is_empty()).count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::classify::Classification;

    struct Fixed;

    impl Classifier for Fixed {
        fn classify(&self, _path: &Path) -> Classification {
            Classification {
                language: Some("Rust".to_string()),
                project: Some("heartline".to_string()),
                project_root: Some("/work/heartline".to_string()),
            }
        }
    }

    #[test]
    fn relative_paths_resolved_against_base() {
        assert_eq!(
            normalize_path("src/lib.rs", Some(Path::new("/work/heartline"))),
            "/work/heartline/src/lib.rs"
        );
    }

    #[test]
    fn windows_paths_use_forward_slashes() {
        assert_eq!(normalize_path(r"c:\Users\bob\main.go", None), "C:/Users/bob/main.go");
    }

    #[test]
    fn playground_directory_points_at_contents() {
        let dir = tempfile::tempdir().unwrap();
        let playground = dir.path().join("Demo.playground");
        std::fs::create_dir_all(&playground).unwrap();

        let stage = NormalizationStage::default();
        let mut h = Heartbeat::new(playground.to_string_lossy(), 1.0);
        stage.normalize(&mut h);
        assert!(h.entity.ends_with("Demo.playground/Contents.swift"));
    }

    #[test]
    fn xcodeproj_directory_points_at_pbxproj() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("App.xcodeproj");
        std::fs::create_dir_all(&project).unwrap();

        let stage = NormalizationStage::default();
        let mut h = Heartbeat::new(project.to_string_lossy(), 1.0);
        stage.normalize(&mut h);
        assert!(h.entity.ends_with("App.xcodeproj/project.pbxproj"));
    }

    #[test]
    fn classification_fills_only_missing_fields() {
        let stage = NormalizationStage::new(Arc::new(Fixed));
        let mut h = Heartbeat::new("/work/heartline/src/lib.rs", 1.0);
        h.project = Some("explicit".to_string());
        stage.normalize(&mut h);

        assert_eq!(h.project.as_deref(), Some("explicit"));
        assert_eq!(h.language.as_deref(), Some("Rust"));
        assert_eq!(h.project_root.as_deref(), Some("/work/heartline"));
        assert_eq!(h.project_root_count, Some(2));
    }

    #[test]
    fn remote_and_non_file_entities_untouched() {
        let stage = NormalizationStage::new(Arc::new(Fixed));
        let mut remote = Heartbeat::new("ssh://host/srv/x.rs", 1.0);
        stage.normalize(&mut remote);
        assert_eq!(remote.entity, "ssh://host/srv/x.rs");
        assert_eq!(remote.language, None);

        let mut app = Heartbeat::new("Figma", 1.0);
        app.entity_type = EntityKind::App;
        stage.normalize(&mut app);
        assert_eq!(app.entity, "Figma");
    }
}
