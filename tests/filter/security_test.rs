//! Security limits: violations abort before any SQL reaches the source.

#[path = "../common/mod.rs"]
mod common;

use std::cell::Cell;

use common::{engine_for, engine_with, orders_dataset, request, source};
use mantis_query::config::Settings;
use mantis_query::filter::{FilterNode, SecurityError, SecurityGuard, SecurityLimits};
use mantis_query::model::Row;
use mantis_query::source::{DataSource, SourceResult, SqliteSource};
use mantis_query::sql::{Dialect, Query};
use mantis_query::QueryError;
use serde_json::{json, Value};

/// Counts fetches before delegating.
struct SpySource {
    inner: SqliteSource,
    fetches: Cell<usize>,
}

impl SpySource {
    fn new() -> Self {
        Self {
            inner: source(),
            fetches: Cell::new(0),
        }
    }
}

impl DataSource for SpySource {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn fetch(&self, query: &Query) -> SourceResult<Vec<Row>> {
        self.fetches.set(self.fetches.get() + 1);
        self.inner.fetch(query)
    }
}

fn nested_or(levels: usize) -> Value {
    let mut tree = json!({"status": "paid"});
    for _ in 0..levels {
        tree = json!({"OR": [tree, {"status": "open"}]});
    }
    tree
}

fn wide_and(clauses: usize) -> Value {
    Value::Array(
        (0..clauses)
            .map(|i| json!({"field": "amount", "lookup": "gt", "value": i}))
            .collect(),
    )
}

fn validate(limits: SecurityLimits, tree: Value) -> Result<(), SecurityError> {
    let mut warnings = Vec::new();
    SecurityGuard::new(limits).validate(&FilterNode::parse(&tree, &mut warnings))
}

#[test]
fn test_or_nesting_counts_depth() {
    assert!(validate(SecurityLimits::default(), nested_or(10)).is_ok());
    assert_eq!(
        validate(SecurityLimits::default(), nested_or(11)),
        Err(SecurityError::DepthExceeded { depth: 11, max: 10 })
    );
}

#[test]
fn test_and_does_not_count_depth() {
    let mut tree = json!({"status": "paid"});
    for _ in 0..30 {
        tree = json!({"AND": [tree, {"amount": {"gt": 1}}]});
    }
    assert!(validate(SecurityLimits::default(), tree).is_ok());
}

#[test]
fn test_clause_limit() {
    assert!(validate(SecurityLimits::default(), wide_and(100)).is_ok());
    assert_eq!(
        validate(SecurityLimits::default(), wide_and(101)),
        Err(SecurityError::TooManyClauses { max: 100 })
    );
}

#[test]
fn test_quantifier_subtrees_count() {
    let limits = SecurityLimits {
        max_depth: 1,
        ..SecurityLimits::default()
    };
    let shallow = json!({"lines": {"some": {"sku": "A-1"}}});
    assert!(validate(limits.clone(), shallow).is_ok());

    let deep = json!({"lines": {"some": {"OR": [{"sku": "A-1"}, {"sku": "B-2"}]}}});
    assert!(matches!(
        validate(limits, deep),
        Err(SecurityError::DepthExceeded { .. })
    ));
}

#[test]
fn test_regex_checks() {
    let long = "a".repeat(501);
    assert!(matches!(
        validate(SecurityLimits::default(), json!({"status": {"regex": long}})),
        Err(SecurityError::RegexTooLong { length: 501, .. })
    ));
    assert!(matches!(
        validate(SecurityLimits::default(), json!({"status": {"regex": "(a+)+$"}})),
        Err(SecurityError::UnsafeRegex { .. })
    ));
    assert!(matches!(
        validate(SecurityLimits::default(), json!({"status": {"iregex": "(unclosed"}})),
        Err(SecurityError::InvalidRegex { .. })
    ));
    assert!(validate(SecurityLimits::default(), json!({"status": {"regex": "^pa(id)?$"}})).is_ok());

    let unchecked = SecurityLimits {
        regex_safety_check: false,
        ..SecurityLimits::default()
    };
    assert!(validate(unchecked, json!({"status": {"regex": "(a+)+$"}})).is_ok());
}

#[test]
fn test_violations_never_reach_the_source() {
    let mut dataset = orders_dataset();
    dataset.metadata.allow_ad_hoc = true;
    let engine = engine_for(dataset);
    let spy = SpySource::new();

    let violations = [
        json!({"filters": nested_or(11)}),
        json!({"filters": wide_and(101)}),
        json!({"filters": {"status": {"regex": "(.*)*x"}}}),
        json!({"mode": "aggregate", "having": nested_or(12)}),
        json!({"mode": "aggregate", "metrics": [
            {"aggregation": "count", "name": "sneaky", "filter": {"customer__name": {"regex": "(x+)+"}}}
        ]}),
    ];
    for payload in violations {
        let err = engine.execute(&request(payload.clone()), &spy, None).unwrap_err();
        assert!(err.is_security(), "{}: {}", payload, err);
    }
    assert_eq!(spy.fetches.get(), 0);

    let ok = engine
        .execute(&request(json!({"filters": {"status": "paid"}})), &spy, None)
        .unwrap();
    assert_eq!(ok.rows.len(), 3);
    assert_eq!(spy.fetches.get(), 1);
}

#[test]
fn test_dataset_default_filters_are_guarded() {
    let mut dataset = orders_dataset();
    dataset.default_filters = Some(nested_or(11));
    let engine = engine_for(dataset);
    let spy = SpySource::new();

    let err = engine.execute(&request(json!({})), &spy, None).unwrap_err();
    assert!(matches!(
        err,
        QueryError::Security(SecurityError::DepthExceeded { .. })
    ));
    assert_eq!(spy.fetches.get(), 0);
}

#[test]
fn test_limits_come_from_settings() {
    let mut settings = Settings::default();
    settings.security.max_clauses = 2;
    let engine = engine_with(orders_dataset(), settings);

    let err = engine
        .plan(&request(json!({"filters": wide_and(3)})))
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Security(SecurityError::TooManyClauses { max: 2 })
    ));
    assert!(engine.plan(&request(json!({"filters": wide_and(2)}))).is_ok());
}
