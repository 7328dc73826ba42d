//! Durable persistence for the delivery queue.
//!
//! The queue persists through the [`QueueStore`] trait so the backing
//! medium stays swappable; the shipped implementation is SQLite. Writes
//! replace the full entry set in one transaction, which keeps the store
//! trivially consistent with the in-memory queue it mirrors.

use super::{EntryId, EntryStatus, QueuedMessage};
use crate::error::{Error, Result};
use crate::protocol::DataMessage;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Persistence contract for the delivery queue.
pub trait QueueStore: Send + Sync {
    /// Load every stored entry.
    fn load(&self) -> Result<Vec<QueuedMessage>>;

    /// Replace the stored entry set.
    fn save_all(&self, entries: &[QueuedMessage]) -> Result<()>;

    /// Remove every stored entry.
    fn clear(&self) -> Result<()>;
}

/// SQLite-backed queue store.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    /// Open or create a queue database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queued_messages (
                id TEXT PRIMARY KEY,
                message TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt INTEGER NOT NULL DEFAULT 0,
                next_retry INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_queue_status ON queued_messages(status);
            CREATE INDEX IF NOT EXISTS idx_queue_next_retry ON queued_messages(next_retry);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

impl QueueStore for SqliteQueueStore {
    fn load(&self) -> Result<Vec<QueuedMessage>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))?;

        let mut stmt = conn.prepare(
            "SELECT id, message, attempts, last_attempt, next_retry, status
             FROM queued_messages",
        )?;

        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let message: String = row.get(1)?;
            let attempts: i64 = row.get(2)?;
            let last_attempt: i64 = row.get(3)?;
            let next_retry: i64 = row.get(4)?;
            let status: i64 = row.get(5)?;
            Ok((id, message, attempts, last_attempt, next_retry, status))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, message, attempts, last_attempt, next_retry, status) = row?;

            let id_bytes: [u8; 16] = hex::decode(&id)
                .map_err(|e| Error::Storage(e.to_string()))?
                .try_into()
                .map_err(|_| Error::Storage("invalid entry id length".into()))?;

            entries.push(QueuedMessage {
                id: EntryId(id_bytes),
                message: DataMessage::from_json(&message)?,
                attempts: attempts as u32,
                last_attempt,
                next_retry,
                status: EntryStatus::from(status as i32),
            });
        }

        Ok(entries)
    }

    fn save_all(&self, entries: &[QueuedMessage]) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queued_messages", [])?;
        for entry in entries {
            tx.execute(
                r#"INSERT INTO queued_messages
                   (id, message, attempts, last_attempt, next_retry, status)
                   VALUES (?, ?, ?, ?, ?, ?)"#,
                params![
                    hex::encode(entry.id.0),
                    entry.message.to_json()?,
                    entry.attempts as i64,
                    entry.last_attempt,
                    entry.next_retry,
                    entry.status as i32,
                ],
            )?;
        }
        tx.commit()?;

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))?;

        conn.execute("DELETE FROM queued_messages", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::now_millis;

    fn entry(text: &str) -> QueuedMessage {
        QueuedMessage {
            id: EntryId::random(),
            message: DataMessage::text("alice", text),
            attempts: 0,
            last_attempt: 0,
            next_retry: now_millis(),
            status: EntryStatus::Pending,
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let store = SqliteQueueStore::open_in_memory().unwrap();

        let mut first = entry("one");
        first.attempts = 3;
        first.status = EntryStatus::Failed;
        let second = entry("two");

        store.save_all(&[first.clone(), second.clone()]).unwrap();
        let mut loaded = store.load().unwrap();
        loaded.sort_by_key(|e| e.message.timestamp);

        assert_eq!(loaded.len(), 2);
        let restored = loaded.iter().find(|e| e.id == first.id).unwrap();
        assert_eq!(restored.attempts, 3);
        assert_eq!(restored.status, EntryStatus::Failed);
        assert_eq!(restored.message.id, first.message.id);
    }

    #[test]
    fn test_save_all_replaces() {
        let store = SqliteQueueStore::open_in_memory().unwrap();

        store.save_all(&[entry("one"), entry("two")]).unwrap();
        let survivor = entry("three");
        store.save_all(&[survivor.clone()]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, survivor.id);
    }

    #[test]
    fn test_clear() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        store.save_all(&[entry("one")]).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_empty_load() {
        let store = SqliteQueueStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_empty());
    }
}
