use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::StateStore;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);";

/// SQLite-backed state store. Values are stored as JSON text; expiry is
/// a unix-millisecond timestamp checked on read.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> WeftError {
    WeftError::Database(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteStateStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete expired rows. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))?;
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now_ms()],
        )
        .map_err(db_err)
    }
}

/// Live value and expiry for `key`, if any.
fn read_live(conn: &Connection, key: &str) -> Result<Option<(serde_json::Value, Option<i64>)>> {
    let row: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT value, expires_at FROM kv WHERE key = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;

    match row {
        Some((_, Some(exp))) if exp <= now_ms() => {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(db_err)?;
            Ok(None)
        }
        Some((raw, exp)) => {
            let value = serde_json::from_str(&raw)?;
            Ok(Some((value, exp)))
        }
        None => Ok(None),
    }
}

impl StateStore for SqliteStateStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            Ok(read_live(&conn, &key)?.map(|(v, _)| v))
        })
    }

    fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let raw = serde_json::to_string(&value)?;
            let expires_at = ttl.and_then(|d| {
                i64::try_from(d.as_millis())
                    .ok()
                    .and_then(|ms| now_ms().checked_add(ms))
            });
            let conn = self
                .conn
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, raw, expires_at],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            let live = read_live(&conn, &key)?.is_some();
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map_err(db_err)?;
            Ok(live)
        })
    }

    fn exists(&self, key: &str) -> BoxFuture<'_, Result<bool>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            Ok(read_live(&conn, &key)?.is_some())
        })
    }

    fn increment(&self, key: &str, by: i64) -> BoxFuture<'_, Result<i64>> {
        let key = key.to_string();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WeftError::Database(e.to_string()))?;
            let (current, expires_at) = match read_live(&conn, &key)? {
                Some((v, exp)) => {
                    let n = v.as_i64().ok_or_else(|| {
                        WeftError::StateStore(format!("value at {} is not an integer", key))
                    })?;
                    (n, exp)
                }
                None => (0, None),
            };
            let next = current + by;
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, next.to_string(), expires_at],
            )
            .map_err(db_err)?;
            Ok(next)
        })
    }
}
