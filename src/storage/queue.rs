//! Durable offline queue.
//!
//! Heartbeats that could not be delivered are stored keyed by their
//! idempotency key until a resync pass confirms delivery. The queue file is
//! shared by every editor process on the machine, so each operation runs in
//! its own transaction: mutations take the write lock up front (`IMMEDIATE`)
//! and hold it until commit, reads use a deferred transaction.

// SQLite returns i64 for row IDs; AUTOINCREMENT ids are always positive.
#![allow(clippy::cast_sign_loss)]

use crate::core::error::HeartlineError;
use crate::core::heartbeat::{Heartbeat, IdempotencyKey};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default file name of the queue database inside the data directory.
pub const QUEUE_FILENAME: &str = "offline_heartbeats.db";

/// Default time to wait for another process to release the write lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(5000);

const LAST_SYNC_KEY: &str = "last_sync_at";

const QUEUE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS heartbeats (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    heartbeat TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Errors that can occur in the offline queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to open queue at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("queue is locked by another process")]
    Locked,
    #[error("database error: {0}")]
    Database(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Locked,
            _ => Self::Database(err),
        }
    }
}

impl From<QueueError> for HeartlineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Locked => {
                Self::store("queue_locked", err.to_string(), "storage:queue")
                    .with_hint("Another editor is using the offline queue; retry shortly")
            }
            QueueError::Open { ref path, .. } => {
                let path = path.display().to_string();
                Self::store("queue_open_failed", err.to_string(), "storage:queue")
                    .with_context("path", path)
            }
            _ => Self::store("queue_error", err.to_string(), "storage:queue"),
        }
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// A heartbeat waiting for redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    pub key: IdempotencyKey,
    pub heartbeat: Heartbeat,
    /// Insertion order.
    pub seq: u64,
}

/// Storage backend for undelivered heartbeats.
pub trait OfflineQueue: Send + Sync {
    /// Stores a heartbeat under its key. An existing record with the same key
    /// wins; returns whether a new record was written.
    fn enqueue(&self, heartbeat: &Heartbeat) -> Result<bool> {
        self.enqueue_all(std::slice::from_ref(heartbeat))
            .map(|written| written > 0)
    }

    /// Stores heartbeats in one transaction, returning how many were new.
    fn enqueue_all(&self, heartbeats: &[Heartbeat]) -> Result<usize>;

    /// Returns up to `max` records in insertion order without removing them.
    fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedRecord>>;

    /// Deletes records by key. Unknown keys are ignored.
    fn remove(&self, keys: &[IdempotencyKey]) -> Result<usize>;

    /// Number of queued records.
    fn count(&self) -> Result<usize>;

    /// Completion time of the last resync pass.
    fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>>;

    fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()>;
}

/// Thread-safe handle to any queue.
pub type SharedQueue = Arc<dyn OfflineQueue>;

/// SQLite-backed queue.
pub struct SqliteQueue {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueue").field("path", &self.path).finish()
    }
}

impl SqliteQueue {
    /// Opens or creates the queue at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the schema cannot be
    /// initialized within `lock_timeout`.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let open_err = |source| QueueError::Open {
            path: path.clone(),
            source,
        };
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(open_err)?;
        conn.busy_timeout(lock_timeout).map_err(open_err)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(QUEUE_SCHEMA)?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove_locked(conn: &mut Connection, keys: &[IdempotencyKey]) -> Result<usize> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM heartbeats WHERE id = ?1")?;
            for key in keys {
                removed += stmt.execute(params![key.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[allow(clippy::significant_drop_tightening)]
impl OfflineQueue for SqliteQueue {
    fn enqueue_all(&self, heartbeats: &[Heartbeat]) -> Result<usize> {
        if heartbeats.is_empty() {
            return Ok(0);
        }
        let encoded = heartbeats
            .iter()
            .map(|h| Ok((h.key(), serde_json::to_string(h)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO heartbeats (id, heartbeat) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            )?;
            for (key, json) in &encoded {
                written += stmt.execute(params![key.as_str(), json])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedRecord>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(max).unwrap_or(i64::MAX);

        let mut conn = self.conn.lock().expect("lock poisoned");
        let rows = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let rows = {
                let mut stmt = tx.prepare_cached(
                    "SELECT seq, id, heartbeat FROM heartbeats ORDER BY seq ASC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };
            tx.commit()?;
            rows
        };

        let mut records = Vec::with_capacity(rows.len());
        let mut poisoned = Vec::new();
        for (seq, id, json) in rows {
            match serde_json::from_str::<Heartbeat>(&json) {
                Ok(heartbeat) => records.push(QueuedRecord {
                    key: IdempotencyKey::from_stored(id),
                    heartbeat,
                    seq: seq as u64,
                }),
                Err(err) => {
                    tracing::warn!(id = %id, error = %err, "dropping undecodable queued heartbeat");
                    poisoned.push(IdempotencyKey::from_stored(id));
                }
            }
        }
        if !poisoned.is_empty() {
            Self::remove_locked(&mut conn, &poisoned)?;
        }
        Ok(records)
    }

    fn remove(&self, keys: &[IdempotencyKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock().expect("lock poisoned");
        Self::remove_locked(&mut conn, keys)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM heartbeats", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![LAST_SYNC_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|raw| match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(err) => {
                tracing::warn!(value = %raw, error = %err, "ignoring unparsable sync cursor");
                None
            }
        }))
    }

    fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_SYNC_KEY, at.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    records: Vec<QueuedRecord>,
    index: HashMap<IdempotencyKey, u64>,
    next_seq: u64,
    last_sync_at: Option<DateTime<Utc>>,
}

/// In-memory queue for testing.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<InMemoryState>,
}

impl InMemoryQueue {
    /// Creates a new empty in-memory queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[allow(clippy::significant_drop_tightening)]
impl OfflineQueue for InMemoryQueue {
    fn enqueue_all(&self, heartbeats: &[Heartbeat]) -> Result<usize> {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut written = 0;
        for heartbeat in heartbeats {
            let key = heartbeat.key();
            if state.index.contains_key(&key) {
                continue;
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.index.insert(key.clone(), seq);
            state.records.push(QueuedRecord {
                key,
                heartbeat: heartbeat.clone(),
                seq,
            });
            written += 1;
        }
        Ok(written)
    }

    fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedRecord>> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.records.iter().take(max).cloned().collect())
    }

    fn remove(&self, keys: &[IdempotencyKey]) -> Result<usize> {
        let mut state = self.state.lock().expect("lock poisoned");
        let before = state.records.len();
        for key in keys {
            state.index.remove(key);
        }
        let InMemoryState { records, index, .. } = &mut *state;
        records.retain(|r| index.contains_key(&r.key));
        Ok(before - state.records.len())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.state.lock().expect("lock poisoned").records.len())
    }

    fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().expect("lock poisoned").last_sync_at)
    }

    fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.state.lock().expect("lock poisoned").last_sync_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heartbeat::EntityKind;

    fn hb(entity: &str, time: f64) -> Heartbeat {
        Heartbeat::new(entity, time)
    }

    fn open(dir: &tempfile::TempDir) -> SqliteQueue {
        SqliteQueue::open(dir.path().join(QUEUE_FILENAME), DEFAULT_LOCK_TIMEOUT).unwrap()
    }

    #[test]
    fn sqlite_enqueue_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);

        let first = hb("/a.rs", 1.0);
        let mut second = first.clone();
        second.branch = Some("later".to_string());

        assert!(queue.enqueue(&first).unwrap());
        assert!(!queue.enqueue(&second).unwrap());
        assert_eq!(queue.count().unwrap(), 1);

        let records = queue.dequeue_batch(10).unwrap();
        assert_eq!(records[0].heartbeat.branch, None);
        assert_eq!(records[0].key, first.key());
    }

    #[test]
    fn sqlite_keeps_heartbeats_whose_fields_share_dashes() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);

        let mut a = hb("b-c", 1.0);
        a.entity_type = EntityKind::App;
        a.project = Some("a".to_string());
        let mut b = hb("c", 1.0);
        b.entity_type = EntityKind::App;
        b.project = Some("a-b".to_string());

        assert_eq!(queue.enqueue_all(&[a, b]).unwrap(), 2);
        assert_eq!(queue.count().unwrap(), 2);
    }

    #[test]
    fn sqlite_stores_routing_key() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let mut h = hb("/work/a.rs", 1.0);
        h.api_key = Some("work".to_string());
        queue.enqueue(&h).unwrap();

        let records = queue.dequeue_batch(1).unwrap();
        assert_eq!(records[0].heartbeat.api_key.as_deref(), Some("work"));
    }

    #[test]
    fn sqlite_dequeue_is_ordered_and_non_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        queue
            .enqueue_all(&[hb("/c.rs", 3.0), hb("/a.rs", 1.0), hb("/b.rs", 2.0)])
            .unwrap();

        let batch = queue.dequeue_batch(2).unwrap();
        let entities: Vec<_> = batch.iter().map(|r| r.heartbeat.entity.as_str()).collect();
        assert_eq!(entities, vec!["/c.rs", "/a.rs"]);
        assert!(batch[0].seq < batch[1].seq);
        assert_eq!(queue.count().unwrap(), 3);
    }

    #[test]
    fn sqlite_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        let h = hb("/a.rs", 1.0);
        queue.enqueue(&h).unwrap();

        assert_eq!(queue.remove(&[h.key()]).unwrap(), 1);
        assert_eq!(queue.remove(&[h.key()]).unwrap(), 0);
        assert_eq!(
            queue
                .remove(&[IdempotencyKey::from_stored("never-stored")])
                .unwrap(),
            0
        );
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let queue = open(&dir);
            queue.enqueue(&hb("/a.rs", 1.0)).unwrap();
            queue.set_last_sync_at(now).unwrap();
        }
        let queue = open(&dir);
        assert_eq!(queue.count().unwrap(), 1);
        let cursor = queue.last_sync_at().unwrap().unwrap();
        assert_eq!(cursor.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn sqlite_two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(&dir);
        let b = open(&dir);
        a.enqueue(&hb("/a.rs", 1.0)).unwrap();
        b.enqueue(&hb("/a.rs", 1.0)).unwrap();
        b.enqueue(&hb("/b.rs", 2.0)).unwrap();
        assert_eq!(a.count().unwrap(), 2);
    }

    #[test]
    fn sqlite_write_lock_times_out_fast() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SqliteQueue::open(dir.path().join(QUEUE_FILENAME), Duration::from_millis(50))
            .unwrap();

        let holder = Connection::open(dir.path().join(QUEUE_FILENAME)).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let err = queue.enqueue(&hb("/a.rs", 1.0)).unwrap_err();
        assert!(matches!(err, QueueError::Locked), "{err}");

        holder.execute_batch("ROLLBACK").unwrap();
        assert!(queue.enqueue(&hb("/a.rs", 1.0)).unwrap());
    }

    #[test]
    fn sqlite_undecodable_rows_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open(&dir);
        queue.enqueue(&hb("/good.rs", 2.0)).unwrap();
        {
            let raw = Connection::open(dir.path().join(QUEUE_FILENAME)).unwrap();
            raw.execute(
                "INSERT INTO heartbeats (id, heartbeat) VALUES ('bad', '{not json')",
                [],
            )
            .unwrap();
        }
        let records = queue.dequeue_batch(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn in_memory_matches_contract() {
        let queue = InMemoryQueue::new();
        let a = hb("/a.rs", 1.0);
        assert!(queue.enqueue(&a).unwrap());
        assert!(!queue.enqueue(&a).unwrap());
        queue.enqueue(&hb("/b.rs", 2.0)).unwrap();

        assert_eq!(queue.dequeue_batch(1).unwrap()[0].key, a.key());
        assert_eq!(queue.remove(&[a.key(), a.key()]).unwrap(), 1);
        assert_eq!(queue.count().unwrap(), 1);
        assert!(queue.last_sync_at().unwrap().is_none());
    }
}
