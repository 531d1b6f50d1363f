//! SQLite-backed durable message store.
//!
//! The store is the single source of truth for delivery state. Rows are
//! append-only: the `processed` flag flips 0→1 exactly once via
//! [`MessageStore::mark_processed`] and never reverts, and rows are never
//! deleted, so the table doubles as an audit trail. Registry and pending-ack
//! state are in-memory only and are rebuilt from this table after a restart.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;

/// A durable message row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub recipient: String,
    pub text: String,
    pub processed_text: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: String,
}

impl StoredMessage {
    /// The text actually delivered to the consumer: the transformed body when
    /// the transform collaborator produced one, the raw producer text otherwise.
    pub fn delivery_text(&self) -> &str {
        self.processed_text.as_deref().unwrap_or(&self.text)
    }
}

/// Handle to the message database. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    /// Open (and bootstrap) the database at `path`, creating parent
    /// directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                text TEXT NOT NULL,
                processed_text TEXT,
                metadata TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_unprocessed
                ON messages (recipient, processed, id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append a new message and return its assigned id. AUTOINCREMENT keeps
    /// ids monotonic and never reused, even across deletes of the sqlite
    /// sequence table.
    pub fn append(
        &self,
        recipient: &str,
        text: &str,
        processed_text: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let metadata = metadata.map(Value::to_string);
        conn.execute(
            "INSERT INTO messages (recipient, text, processed_text, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                recipient,
                text,
                processed_text,
                metadata,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All unprocessed messages for `recipient`, ascending id order.
    pub fn fetch_unprocessed(&self, recipient: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, recipient, text, processed_text, metadata, created_at
             FROM messages
             WHERE recipient = ?1 AND processed = 0
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![recipient], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(decode_metadata(row?)?);
        }
        Ok(messages)
    }

    /// Atomically flip `processed` 0→1. Returns `false` when the row is
    /// absent or already processed, which makes duplicate confirms a no-op.
    pub fn mark_processed(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET processed = 1 WHERE id = ?1 AND processed = 0",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Whether the row exists and is still awaiting a confirm.
    pub fn is_unprocessed(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT id FROM messages WHERE id = ?1 AND processed = 0",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Fetch a single message by id.
    pub fn get(&self, id: i64) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, recipient, text, processed_text, metadata, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                row_to_message,
            )
            .optional()?;
        match row {
            Some(raw) => Ok(Some(decode_metadata(raw)?)),
            None => Ok(None),
        }
    }
}

/// Intermediate row with the metadata column still undecoded; rusqlite row
/// mapping cannot return serde errors.
struct RawRow {
    message: StoredMessage,
    metadata: Option<String>,
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        message: StoredMessage {
            id: row.get(0)?,
            recipient: row.get(1)?,
            text: row.get(2)?,
            processed_text: row.get(3)?,
            metadata: None,
            created_at: row.get(5)?,
        },
        metadata: row.get(4)?,
    })
}

fn decode_metadata(raw: RawRow) -> Result<StoredMessage> {
    let mut message = raw.message;
    if let Some(text) = raw.metadata {
        message.metadata = Some(serde_json::from_str(&text)?);
    }
    Ok(message)
}
