//! SQLite-backed key-value store.
//!
//! Keeps every key in a single `kv` table so that the queue and the
//! last-sync timestamp live in one database file on the device.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::store::KeyValueStore;
use outbox_common::{Error, Result};

/// Key-value store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Arguments
    /// - `db_path`: Path to the SQLite database file
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(sqlite_error)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(sqlite_error)?;

        info!("SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))?;
        f(&conn).map_err(sqlite_error)
    }
}

fn sqlite_error(err: rusqlite::Error) -> Error {
    Error::Storage(format!("sqlite: {}", err))
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
        })
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        debug!("Upserting key: {}", key);
        let now = chrono::Utc::now().timestamp();
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO kv (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![key, value, now],
            )
            .map(|_| ())
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM kv WHERE key = ?1", [key]).map(|_| ()))
    }
}
