//! Language and project classification.
//!
//! Classification never fails: anything that cannot be determined is left
//! empty and the heartbeat continues through the pipeline.

use std::path::Path;

/// Result of classifying an entity path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub language: Option<String>,
    pub project: Option<String>,
    pub project_root: Option<String>,
}

/// Pure function from entity path to classification.
pub trait Classifier: Send + Sync {
    fn classify(&self, path: &Path) -> Classification;
}

const LANGUAGES: &[(&str, &str)] = &[
    ("c", "C"),
    ("cc", "C++"),
    ("cpp", "C++"),
    ("cs", "C#"),
    ("css", "CSS"),
    ("dart", "Dart"),
    ("ex", "Elixir"),
    ("exs", "Elixir"),
    ("go", "Go"),
    ("h", "C"),
    ("hpp", "C++"),
    ("hs", "Haskell"),
    ("html", "HTML"),
    ("java", "Java"),
    ("js", "JavaScript"),
    ("json", "JSON"),
    ("jsx", "JavaScript"),
    ("kt", "Kotlin"),
    ("lua", "Lua"),
    ("md", "Markdown"),
    ("php", "PHP"),
    ("py", "Python"),
    ("rb", "Ruby"),
    ("rs", "Rust"),
    ("scala", "Scala"),
    ("sh", "Bash"),
    ("sql", "SQL"),
    ("swift", "Swift"),
    ("toml", "TOML"),
    ("ts", "TypeScript"),
    ("tsx", "TypeScript"),
    ("yaml", "YAML"),
    ("yml", "YAML"),
    ("zig", "Zig"),
];

/// Markers whose presence identifies a project root directory.
const PROJECT_MARKERS: [&str; 3] = [".git", ".hg", ".heartline-project"];

/// Extension lookup plus an upward search for a VCS root.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    fn language(path: &Path) -> Option<String> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        LANGUAGES
            .binary_search_by(|(candidate, _)| candidate.cmp(&ext.as_str()))
            .ok()
            .map(|idx| LANGUAGES[idx].1.to_string())
    }

    fn project_root(path: &Path) -> Option<&Path> {
        path.ancestors()
            .skip(1)
            .find(|dir| PROJECT_MARKERS.iter().any(|m| dir.join(m).exists()))
    }
}

impl Classifier for HeuristicClassifier {
    fn classify(&self, path: &Path) -> Classification {
        let root = Self::project_root(path);
        Classification {
            language: Self::language(path),
            project: root
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned()),
            project_root: root.map(|r| r.to_string_lossy().into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_table_is_sorted() {
        assert!(LANGUAGES.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn classifies_language_and_git_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rocket");
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();

        let c = HeuristicClassifier.classify(&root.join("src").join("Main.PY"));
        assert_eq!(c.language.as_deref(), Some("Python"));
        assert_eq!(c.project.as_deref(), Some("rocket"));
        assert_eq!(
            c.project_root.as_deref(),
            Some(root.to_string_lossy().as_ref())
        );
    }

    #[test]
    fn unknown_paths_classify_empty() {
        let c = HeuristicClassifier.classify(Path::new("/nonexistent/blob.unknownext"));
        assert_eq!(c.language, None);
        assert_eq!(c.project, None);
    }
}
