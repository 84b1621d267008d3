//! Result caching through both stores.

#[path = "../common/mod.rs"]
mod common;

use std::cell::Cell;

use chrono::{TimeZone, Utc};
use common::{engine_for, engine_with, orders_dataset, request, source};
use mantis_query::cache::{CacheStore, MemoryCache, SqliteCache};
use mantis_query::config::Settings;
use mantis_query::model::{QueryRequest, Row};
use mantis_query::source::{DataSource, SourceResult, SqliteSource};
use mantis_query::sql::{Dialect, Query};
use mantis_query::DatasetEngine;
use serde_json::json;

struct CountingSource {
    inner: SqliteSource,
    fetches: Cell<usize>,
}

impl CountingSource {
    fn new() -> Self {
        Self {
            inner: source(),
            fetches: Cell::new(0),
        }
    }
}

impl DataSource for CountingSource {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn fetch(&self, query: &Query) -> SourceResult<Vec<Row>> {
        self.fetches.set(self.fetches.get() + 1);
        self.inner.fetch(query)
    }
}

fn revenue_by_status() -> QueryRequest {
    request(json!({
        "mode": "aggregate",
        "dimensions": ["status"],
        "metrics": ["revenue", "orders"],
        "filters": {"amount": {"gte": 50}, "status": {"ne": "open"}},
        "ordering": ["status"]
    }))
}

fn assert_second_call_hits(engine: &DatasetEngine, cache: &dyn CacheStore) {
    let source = CountingSource::new();

    let first = engine.execute(&revenue_by_status(), &source, Some(cache)).unwrap();
    assert!(!first.cache.hit);
    assert!(first.cache.key.as_deref().is_some_and(|k| k.starts_with("mantis-query:orders:0:")));
    assert_eq!(first.cache.ttl_seconds, Some(300));

    let second = engine.execute(&revenue_by_status(), &source, Some(cache)).unwrap();
    assert!(second.cache.hit);
    assert_eq!(source.fetches.get(), 1);

    let mut unmarked = second.clone();
    unmarked.cache.hit = false;
    assert_eq!(unmarked, first);
}

#[test]
fn test_memory_cache_hit() {
    let cache = MemoryCache::new();
    assert_second_call_hits(&engine_for(orders_dataset()), &cache);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_sqlite_cache_hit_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache").join("results.db");
    let engine = engine_for(orders_dataset());

    {
        let cache = SqliteCache::open(&path).unwrap();
        assert_second_call_hits(&engine, &cache);
    }

    let reopened = SqliteCache::open(&path).unwrap();
    let source = CountingSource::new();
    let result = engine.execute(&revenue_by_status(), &source, Some(&reopened)).unwrap();
    assert!(result.cache.hit);
    assert_eq!(source.fetches.get(), 0);
}

#[test]
fn test_key_ignores_filter_key_order_and_cache_flag() {
    let engine = engine_for(orders_dataset());
    let cache = MemoryCache::new();
    let source = CountingSource::new();

    let a = request(json!({"fields": ["id"], "filters": {"status": "paid", "amount": {"gt": 1}}}));
    let b = request(json!({"filters": {"amount": {"gt": 1}, "status": "paid"}, "fields": ["id"], "cache": true}));

    let first = engine.execute(&a, &source, Some(&cache)).unwrap();
    let second = engine.execute(&b, &source, Some(&cache)).unwrap();
    assert!(second.cache.hit);
    assert_eq!(first.cache.key, second.cache.key);
    assert_eq!(source.fetches.get(), 1);
}

#[test]
fn test_different_requests_miss() {
    let engine = engine_for(orders_dataset());
    let cache = MemoryCache::new();
    let source = CountingSource::new();

    engine.execute(&request(json!({"limit": 2})), &source, Some(&cache)).unwrap();
    let other = engine.execute(&request(json!({"limit": 3})), &source, Some(&cache)).unwrap();
    assert!(!other.cache.hit);
    assert_eq!(source.fetches.get(), 2);
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_dataset_edit_invalidates() {
    let cache = MemoryCache::new();
    let source = CountingSource::new();

    let original = engine_for(orders_dataset());
    original.execute(&revenue_by_status(), &source, Some(&cache)).unwrap();

    let mut edited = orders_dataset();
    edited.updated_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
    let result = engine_for(edited)
        .execute(&revenue_by_status(), &source, Some(&cache))
        .unwrap();

    assert!(!result.cache.hit);
    assert!(result
        .cache
        .key
        .as_deref()
        .is_some_and(|k| k.starts_with("mantis-query:orders:1709283600000:")));
    assert_eq!(source.fetches.get(), 2);
}

#[test]
fn test_opt_outs() {
    let source = CountingSource::new();
    let cache = MemoryCache::new();

    let engine = engine_for(orders_dataset());
    let result = engine
        .execute(&request(json!({"cache": false})), &source, Some(&cache))
        .unwrap();
    assert!(result.cache.key.is_none());

    let mut no_ttl = orders_dataset();
    no_ttl.metadata.cache_ttl_seconds = Some(0);
    engine_for(no_ttl)
        .execute(&request(json!({})), &source, Some(&cache))
        .unwrap();

    let mut settings = Settings::default();
    settings.cache.enabled = false;
    engine_with(orders_dataset(), settings)
        .execute(&request(json!({})), &source, Some(&cache))
        .unwrap();

    assert!(cache.is_empty());
    assert_eq!(source.fetches.get(), 3);
}

#[test]
fn test_dataset_ttl_overrides_default() {
    let mut dataset = orders_dataset();
    dataset.metadata.cache_ttl_seconds = Some(60);
    let cache = MemoryCache::new();
    let result = engine_for(dataset)
        .execute(&request(json!({})), &source(), Some(&cache))
        .unwrap();
    assert_eq!(result.cache.ttl_seconds, Some(60));
}

#[test]
fn test_expired_entries_are_misses() {
    let cache = MemoryCache::new();
    cache
        .set("k", &json!({"rows": []}), std::time::Duration::from_secs(0))
        .unwrap();
    assert_eq!(cache.get("k").unwrap(), None);

    let sqlite = SqliteCache::open_in_memory().unwrap();
    sqlite
        .set("k", &json!(1), std::time::Duration::from_secs(60))
        .unwrap();
    assert_eq!(sqlite.get("k").unwrap(), Some(json!(1)));
    assert!(sqlite.delete("k").unwrap());
    assert_eq!(sqlite.get("k").unwrap(), None);
}
