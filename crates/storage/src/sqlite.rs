use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{codec, Database};

/// SQLite-backed key-value store. The connection lives behind a mutex and all
/// statement execution happens on the blocking pool so the dispatch path
/// never stalls on disk I/O.
pub struct SqliteDatabase {
    name: String,
    inner: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(name: &str, db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Backend(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Backend(format!("Failed to open sqlite db: {}", e)))?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            name: name.to_string(),
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self
            .inner
            .lock()
            .map_err(|e| Error::Backend(format!("Lock error: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Backend(format!("Failed to init kv schema: {}", e)))?;

        debug!(db = %self.name, "Sqlite kv schema initialized");
        Ok(())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        // open() already established the connection; nothing to re-check.
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let text = codec::to_text(&value)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = inner
                .lock()
                .map_err(|e| Error::Backend(format!("Lock error: {}", e)))?;
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, text, now],
            )
            .map_err(|e| Error::Backend(format!("Put error: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Backend(format!("Blocking task failed: {}", e)))?
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let raw: Option<String> = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let conn = inner
                .lock()
                .map_err(|e| Error::Backend(format!("Lock error: {}", e)))?;
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| Error::Backend(format!("Get error: {}", e)))
        })
        .await
        .map_err(|e| Error::Backend(format!("Blocking task failed: {}", e)))??;

        raw.map(|text| codec::from_text(&text)).transpose()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = inner
                .lock()
                .map_err(|e| Error::Backend(format!("Lock error: {}", e)))?;
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(|e| Error::Backend(format!("Delete error: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Backend(format!("Blocking task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (SqliteDatabase, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::open("sqlite", &dir.path().join("kv.db")).unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn round_trip_including_tagged_timestamps() {
        let (db, _dir) = test_db();
        let dt = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let value = serde_json::json!({
            "last_seen": codec::tag_datetime(&dt),
            "count": 7,
        });

        db.put("seen:alice", value.clone()).await.unwrap();
        let back = db.get("seen:alice").await.unwrap().unwrap();
        assert_eq!(back, value);
        assert_eq!(codec::as_datetime(&back["last_seen"]), Some(dt));
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let (db, _dir) = test_db();
        db.put("k", serde_json::json!(1)).await.unwrap();
        db.put("k", serde_json::json!(2)).await.unwrap();
        assert_eq!(db.get("k").await.unwrap(), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let (db, _dir) = test_db();
        db.put("k", serde_json::json!("v")).await.unwrap();
        db.delete("k").await.unwrap();
        assert_eq!(db.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.db");
        {
            let db = SqliteDatabase::open("sqlite", &path).unwrap();
            db.put("k", serde_json::json!({"v": true})).await.unwrap();
        }
        let db = SqliteDatabase::open("sqlite", &path).unwrap();
        assert_eq!(db.get("k").await.unwrap(), Some(serde_json::json!({"v": true})));
    }
}
