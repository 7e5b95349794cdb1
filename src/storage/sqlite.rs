//! SQLite-backed storage
//!
//! One row per key. Each write batch runs in a single transaction, so either
//! every key in the batch commits or none does.

use super::{check_etag, Storage, StorageError, StorageResult, StoreItem};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// SQL schema for initialization
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS state_items (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    etag TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Thread-safe SQLite storage handle
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.run_migrations()?;
        Ok(storage)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    fn run_migrations(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn read(&self, keys: &[String]) -> StorageResult<HashMap<String, StoreItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value, etag FROM state_items WHERE key = ?1")?;

        let mut items = HashMap::new();
        for key in keys {
            let row: Option<(String, String)> = stmt
                .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()?;
            if let Some((value, etag)) = row {
                items.insert(
                    key.clone(),
                    StoreItem::new(serde_json::from_str(&value)?, Some(etag)),
                );
            }
        }
        Ok(items)
    }

    async fn write(
        &self,
        changes: HashMap<String, StoreItem>,
    ) -> StorageResult<HashMap<String, String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        // Check every key first; dropping `tx` on error rolls back
        for (key, item) in &changes {
            let actual: Option<String> = tx
                .query_row(
                    "SELECT etag FROM state_items WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            check_etag(key, item.etag.as_deref(), actual.as_deref())?;
        }

        let mut etags = HashMap::with_capacity(changes.len());
        for (key, item) in changes {
            let etag = uuid::Uuid::new_v4().to_string();
            let value = serde_json::to_string(&item.value)?;
            tx.execute(
                "INSERT INTO state_items (key, value, etag, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, etag = ?3, updated_at = ?4",
                params![key, value, etag, now],
            )?;
            etags.insert(key, etag);
        }

        tx.commit()?;
        Ok(etags)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM state_items WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        Ok(())
    }
}
