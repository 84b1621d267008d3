//! Result cache.
//!
//! Execution results are memoized behind a content-addressed key:
//!
//! ```text
//! mantis-query:{dataset code}:{dataset version}:{sha256 of the canonical request}
//! ```
//!
//! The dataset version changes whenever the definition is saved, so stale
//! entries are never served after an edit; they simply expire. Two stores
//! are provided: [`MemoryCache`] for a single process and [`SqliteCache`]
//! for a file shared between runs. Both honor a per-entry TTL.

mod hash;
mod memory;
mod sqlite;

pub use hash::compute_hash;
pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache lock poisoned")]
    Poisoned,
}

pub type CacheResult<T> = Result<T, CacheError>;

const KEY_PREFIX: &str = "mantis-query";

/// Cache key for one request against one version of a dataset.
///
/// Independent of the key order of `request`.
pub fn cache_key<T: Serialize>(code: &str, version: &str, request: &T) -> Result<String, serde_json::Error> {
    Ok(format!(
        "{}:{}:{}:{}",
        KEY_PREFIX,
        code,
        version,
        compute_hash(request)?
    ))
}

/// A key/value store with per-entry expiry.
///
/// Implementations make each operation atomic on its own; there is no
/// cross-key consistency.
pub trait CacheStore: Send + Sync {
    /// The live value for `key`; expired entries read as missing.
    fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    fn set(&self, key: &str, value: &Value, ttl: Duration) -> CacheResult<()>;

    /// Returns whether an entry was removed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    fn clear(&self) -> CacheResult<()>;
}
