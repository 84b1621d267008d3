//! SQLite-backed cache store.
//!
//! Entries live in a single `results` table with an absolute expiry in
//! unix milliseconds. The schema is versioned; a version mismatch clears
//! the file on open.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{CacheError, CacheResult, CacheStore};

/// Current cache schema version. Bump this when the cache format changes.
const CACHE_VERSION: i32 = 1;

pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open or create the cache database, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory cache (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CacheResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS results (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        if stored_version != Some(CACHE_VERSION) {
            conn.execute("DELETE FROM results", [])?;
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
                params![CACHE_VERSION.to_string()],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> CacheResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Delete expired rows; returns how many were removed.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now().timestamp_millis();
        Ok(self
            .conn()?
            .execute("DELETE FROM results WHERE expires_at <= ?", params![now])?)
    }

    pub fn len(&self) -> CacheResult<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let now = Utc::now().timestamp_millis();
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM results WHERE key = ? AND expires_at > ?",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()> {
        let json = serde_json::to_string(value)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);
        self.conn()?.execute(
            "INSERT OR REPLACE INTO results (key, value, expires_at) VALUES (?, ?, ?)",
            params![key, json, expires_at],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM results WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    fn clear(&self) -> CacheResult<()> {
        self.conn()?.execute("DELETE FROM results", [])?;
        Ok(())
    }
}
