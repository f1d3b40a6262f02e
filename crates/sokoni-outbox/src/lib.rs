//! Local outbox for messages composed while the remote store is
//! unreachable. Entries are persisted in SQLite so they survive a process
//! restart, flushed in FIFO order, and removed one by one only after their
//! own insert is confirmed, so a failed flush can never re-send an
//! already-delivered message.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sokoni_types::models::QueuedMessage;

/// Oldest entries beyond this cap are dropped on enqueue.
pub const DEFAULT_CAP: usize = 50;

/// A queued entry with its stable FIFO position.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub seq: i64,
    pub message: QueuedMessage,
}

pub struct Outbox {
    conn: Mutex<Connection>,
    cap: usize,
}

impl Outbox {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, DEFAULT_CAP)
    }

    /// Non-persistent outbox. Tests only; a real session must survive
    /// restart.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, DEFAULT_CAP)
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self
    }

    fn init(conn: Connection, cap: usize) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS outbox (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                sender_id       TEXT NOT NULL,
                content         TEXT NOT NULL,
                queued_at       TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        debug!("outbox ready");
        Ok(Self {
            conn: Mutex::new(conn),
            cap,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("outbox lock poisoned: {}", e))?;
        f(&conn)
    }

    /// Park a message payload. If the queue is at capacity the oldest
    /// entries are dropped first; losing the newest composition would be
    /// worse than losing a stale one.
    pub fn enqueue(&self, message: &QueuedMessage) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO outbox (conversation_id, sender_id, content) VALUES (?1, ?2, ?3)",
                (
                    message.conversation_id.to_string(),
                    message.sender_id.to_string(),
                    &message.content,
                ),
            )?;
            let seq = conn.last_insert_rowid();

            let dropped = conn.execute(
                "DELETE FROM outbox WHERE seq NOT IN
                     (SELECT seq FROM outbox ORDER BY seq DESC LIMIT ?1)",
                [self.cap as i64],
            )?;
            if dropped > 0 {
                warn!("outbox at capacity, dropped {} oldest entries", dropped);
            }

            info!("queued message for conversation {}", message.conversation_id);
            Ok(seq)
        })
    }

    /// All entries in FIFO order.
    pub fn entries(&self) -> Result<Vec<OutboxEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, conversation_id, sender_id, content FROM outbox ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut entries = Vec::with_capacity(rows.len());
            for (seq, conversation_id, sender_id, content) in rows {
                entries.push(OutboxEntry {
                    seq,
                    message: QueuedMessage {
                        conversation_id: parse_uuid(&conversation_id)?,
                        sender_id: parse_uuid(&sender_id)?,
                        content,
                    },
                });
            }
            Ok(entries)
        })
    }

    /// Remove one entry after its remote insert has been confirmed.
    pub fn remove(&self, seq: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM outbox WHERE seq = ?1", [seq])?;
            Ok(())
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("corrupt outbox row id '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(content: &str) -> QueuedMessage {
        QueuedMessage {
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            content: content.into(),
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let outbox = Outbox::open_in_memory().unwrap();
        outbox.enqueue(&queued("one")).unwrap();
        outbox.enqueue(&queued("two")).unwrap();
        outbox.enqueue(&queued("three")).unwrap();

        let contents: Vec<String> = outbox
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.message.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn remove_only_deletes_confirmed_entry() {
        let outbox = Outbox::open_in_memory().unwrap();
        let first = outbox.enqueue(&queued("sent")).unwrap();
        outbox.enqueue(&queued("still waiting")).unwrap();

        outbox.remove(first).unwrap();

        let entries = outbox.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.content, "still waiting");
    }

    #[test]
    fn cap_drops_oldest() {
        let outbox = Outbox::open_in_memory().unwrap().with_cap(3);
        for i in 0..5 {
            outbox.enqueue(&queued(&format!("m{}", i))).unwrap();
        }

        let contents: Vec<String> = outbox
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.message.content)
            .collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn survives_reopen() {
        let dir = std::env::temp_dir().join(format!("sokoni_outbox_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("outbox.db");

        let message = queued("offline order question");
        {
            let outbox = Outbox::open(&path).unwrap();
            outbox.enqueue(&message).unwrap();
        }

        let reopened = Outbox::open(&path).unwrap();
        let entries = reopened.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, message);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
