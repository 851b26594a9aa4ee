//! modbot-storage: SQLite persistence for infraction and reminder records.
//!
//! The store is the durable source of truth across restarts; the lifecycle
//! crates rebuild their scheduler state from it at startup. A single
//! connection sits behind a tokio mutex and all rusqlite work runs on the
//! blocking pool.

mod infractions;
mod reminders;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

pub use infractions::InfractionQuery;
pub use reminders::ReminderPatch;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("stored timestamp {0} is out of range")]
    BadTimestamp(i64),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS infractions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        user INTEGER NOT NULL,
        guild INTEGER NOT NULL,
        actor INTEGER NOT NULL,
        reason TEXT,
        hidden INTEGER NOT NULL DEFAULT 0,
        active INTEGER NOT NULL DEFAULT 1,
        permanent INTEGER NOT NULL DEFAULT 0,
        inserted_at INTEGER NOT NULL,
        expires_at INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_infractions_lookup
        ON infractions (active, kind, user, guild);
    CREATE INDEX IF NOT EXISTS idx_infractions_expiry
        ON infractions (expires_at);

    CREATE TABLE IF NOT EXISTS reminders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        author INTEGER NOT NULL,
        channel INTEGER NOT NULL,
        guild INTEGER NOT NULL,
        origin_message INTEGER NOT NULL,
        content TEXT NOT NULL,
        expires_at INTEGER NOT NULL,
        mentions TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_reminders_author
        ON reminders (author, expires_at);
";

/// SQLite-backed record store for infractions and reminders.
pub struct ModBotStore {
    conn: Arc<Mutex<Connection>>,
}

impl ModBotStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL for concurrent readers while the lifecycle crates write.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Record store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            Box::new(StorageError::BadTimestamp(ms)),
        )
    })
}
