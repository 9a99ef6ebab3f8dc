//! One-time migration of the legacy JSON-lines queue.
//!
//! Older releases kept undelivered heartbeats in `~/.heartline-queue.jsonl`,
//! one `{"id": ..., "heartbeat": ...}` object per line. The migrator moves
//! every record into the current queue through the normal enqueue contract
//! and then deletes the old file.

use crate::core::error::HeartlineError;
use crate::core::heartbeat::Heartbeat;
use crate::storage::lock;
use crate::storage::queue::{OfflineQueue, QueueError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the legacy queue, relative to the home directory.
pub const LEGACY_QUEUE_FILENAME: &str = ".heartline-queue.jsonl";

/// Errors that can occur while migrating the legacy queue.
#[derive(Debug, thiserror::Error)]
pub enum LegacyError {
    #[error("legacy queue {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to enqueue legacy heartbeats: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to delete legacy queue {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<LegacyError> for HeartlineError {
    fn from(err: LegacyError) -> Self {
        let (code, path) = match &err {
            LegacyError::Unreadable { path, .. } => ("legacy_queue_unreadable", Some(path)),
            LegacyError::Queue(_) => ("legacy_enqueue_failed", None),
            LegacyError::Delete { path, .. } => ("legacy_delete_failed", Some(path)),
        };
        let path = path.map(|p| p.display().to_string());
        let converted = Self::migration(code, err.to_string(), "storage:legacy");
        match path {
            Some(path) => converted.with_context("path", path),
            None => converted,
        }
    }
}

/// One line of the legacy queue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub id: String,
    pub heartbeat: Heartbeat,
}

/// What a migration attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No legacy file exists.
    Absent,
    /// Another process is migrating right now.
    Busy,
    Migrated {
        /// Records read from the legacy file.
        read: usize,
        /// Records that were not already queued.
        enqueued: usize,
        /// Lines that could not be decoded.
        malformed: usize,
    },
}

/// Drains a legacy queue file into the current queue.
#[derive(Debug, Clone)]
pub struct LegacyQueueMigrator {
    legacy_path: PathBuf,
    lock_path: PathBuf,
}

impl LegacyQueueMigrator {
    /// `lock_path` guards against two processes migrating at once.
    #[must_use]
    pub fn new(legacy_path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            legacy_path: legacy_path.into(),
            lock_path: lock_path.into(),
        }
    }

    #[must_use]
    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    /// Migrates all legacy records into `queue` and removes the legacy file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the records cannot be
    /// enqueued, or the file cannot be deleted afterwards. The legacy file is
    /// left in place in every error case except a failed delete.
    pub fn migrate(&self, queue: &dyn OfflineQueue) -> Result<MigrationOutcome, LegacyError> {
        if !self.legacy_path.exists() {
            return Ok(MigrationOutcome::Absent);
        }

        let Some(_lock) = self.try_lock()? else {
            tracing::debug!(lock = %self.lock_path.display(), "legacy migration already running elsewhere");
            return Ok(MigrationOutcome::Busy);
        };

        let content = match fs::read_to_string(&self.legacy_path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(MigrationOutcome::Absent);
            }
            Err(source) => {
                return Err(LegacyError::Unreadable {
                    path: self.legacy_path.clone(),
                    source,
                })
            }
        };

        let mut heartbeats = Vec::new();
        let mut malformed = 0;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LegacyRecord>(line) {
                Ok(record) => heartbeats.push(record.heartbeat),
                Err(err) => {
                    malformed += 1;
                    tracing::warn!(line = lineno + 1, error = %err, "skipping malformed legacy queue line");
                }
            }
        }

        let enqueued = queue.enqueue_all(&heartbeats)?;

        fs::remove_file(&self.legacy_path).map_err(|source| LegacyError::Delete {
            path: self.legacy_path.clone(),
            source,
        })?;

        tracing::info!(
            read = heartbeats.len(),
            enqueued,
            malformed,
            "migrated legacy offline queue"
        );
        Ok(MigrationOutcome::Migrated {
            read: heartbeats.len(),
            enqueued,
            malformed,
        })
    }

    /// Takes the migration lock, or returns `None` if another process has it.
    fn try_lock(&self) -> Result<Option<fs::File>, LegacyError> {
        lock::try_exclusive(&self.lock_path).map_err(|source| LegacyError::Unreadable {
            path: self.lock_path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCategory;
    use crate::storage::queue::InMemoryQueue;
    use std::io::Write;

    fn write_legacy(path: &Path, heartbeats: &[Heartbeat], extra: &str) {
        let mut file = fs::File::create(path).unwrap();
        for h in heartbeats {
            let record = LegacyRecord {
                id: h.key().to_string(),
                heartbeat: h.clone(),
            };
            writeln!(file, "{}", serde_json::to_string(&record).unwrap()).unwrap();
        }
        write!(file, "{extra}").unwrap();
    }

    fn migrator(dir: &tempfile::TempDir) -> LegacyQueueMigrator {
        LegacyQueueMigrator::new(
            dir.path().join(LEGACY_QUEUE_FILENAME),
            dir.path().join("data").join("legacy-migration.lock"),
        )
    }

    #[test]
    fn absent_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let queue = InMemoryQueue::new();
        assert_eq!(
            migrator(&dir).migrate(&queue).unwrap(),
            MigrationOutcome::Absent
        );
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn migrates_records_and_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = migrator(&dir);
        let b = Heartbeat::new("/legacy/b.rs", 1_600_000_000.25);
        write_legacy(m.legacy_path(), &[b.clone()], "{broken\n\n");

        let queue = InMemoryQueue::new();
        let outcome = m.migrate(&queue).unwrap();

        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                read: 1,
                enqueued: 1,
                malformed: 1
            }
        );
        assert!(!m.legacy_path().exists());
        assert_eq!(queue.dequeue_batch(10).unwrap()[0].key, b.key());
    }

    #[test]
    fn existing_records_win_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let m = migrator(&dir);
        let current = Heartbeat::new("/x.rs", 5.0);
        let mut legacy = current.clone();
        legacy.branch = Some("legacy".to_string());
        write_legacy(m.legacy_path(), &[legacy], "");

        let queue = InMemoryQueue::new();
        queue.enqueue(&current).unwrap();
        let outcome = m.migrate(&queue).unwrap();

        assert!(matches!(
            outcome,
            MigrationOutcome::Migrated { enqueued: 0, .. }
        ));
        assert_eq!(queue.dequeue_batch(10).unwrap()[0].heartbeat.branch, None);
    }

    #[test]
    fn held_lock_skips_migration() {
        let dir = tempfile::tempdir().unwrap();
        let m = migrator(&dir);
        write_legacy(m.legacy_path(), &[Heartbeat::new("/x.rs", 5.0)], "");

        let held = m.try_lock().unwrap().unwrap();
        let queue = InMemoryQueue::new();
        assert_eq!(m.migrate(&queue).unwrap(), MigrationOutcome::Busy);
        assert!(m.legacy_path().exists());
        drop(held);

        assert!(matches!(
            m.migrate(&queue).unwrap(),
            MigrationOutcome::Migrated { .. }
        ));
    }

    #[test]
    fn unreadable_file_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let m = migrator(&dir);
        // A directory at the legacy path cannot be read as a file.
        fs::create_dir_all(m.legacy_path()).unwrap();

        let queue = InMemoryQueue::new();
        let err = m.migrate(&queue).unwrap_err();
        assert!(matches!(err, LegacyError::Unreadable { .. }), "{err}");
        assert!(m.legacy_path().exists());

        let err = HeartlineError::from(err);
        assert_eq!(err.category, ErrorCategory::Migration);
        assert_eq!(err.code, "legacy_queue_unreadable");
        assert!(err.recoverable);
        assert_eq!(
            err.context.get("path").map(String::as_str),
            Some(m.legacy_path().display().to_string().as_str())
        );
    }
}
