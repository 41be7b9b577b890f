use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use oncall_config::Config;
use rusqlite::{params, Connection, OptionalExtension};

/// Host-style persisted key/value store. `ttl_seconds <= 0` keeps the value
/// until it is overwritten, and so does a ttl too large to represent.
pub trait KvStore: Send + Sync {
    fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> Result<(), String>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;
}

pub fn open_store(cfg: &Config) -> Result<Box<dyn KvStore>, String> {
    if cfg.store.kind == "sqlite" {
        let sqlite_path = cfg
            .store
            .sqlite_path
            .as_deref()
            .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
        Ok(Box::new(SqliteKv::new(sqlite_path)?))
    } else {
        Ok(Box::new(MemoryKv::default()))
    }
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryValue>>,
}

struct MemoryValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvStore for MemoryKv {
    fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> Result<(), String> {
        let expires_at = if ttl_seconds > 0 {
            Instant::now().checked_add(Duration::from_secs(ttl_seconds as u64))
        } else {
            None
        };
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        entries.insert(
            key.to_string(),
            MemoryValue {
                bytes: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let mut entries = self.entries.lock().map_err(|e| e.to_string())?;
        let expired = match entries.get(key) {
            Some(v) => v.expires_at.is_some_and(|at| at <= Instant::now()),
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|v| v.bytes.clone()))
    }
}

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KvStore for SqliteKv {
    fn set(&self, key: &str, value: &[u8], ttl_seconds: i64) -> Result<(), String> {
        let expires_at = if ttl_seconds > 0 {
            Utc::now().timestamp().checked_add(ttl_seconds)
        } else {
            None
        };
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT OR REPLACE INTO kv(key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let row: Option<(Vec<u8>, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match row {
            Some((_, Some(at))) if at <= Utc::now().timestamp() => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }
}
