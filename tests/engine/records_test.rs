//! Records mode end to end against the shop fixture.

#[path = "../common/mod.rs"]
mod common;

use common::{column, engine_for, orders_dataset, request, source};
use mantis_query::model::ExecutionMode;
use mantis_query::QueryError;
use serde_json::{json, Value};

fn run(payload: Value) -> mantis_query::model::ExecutionResult {
    engine_for(orders_dataset())
        .execute(&request(payload), &source(), None)
        .unwrap()
}

#[test]
fn test_default_request_lists_record_fields() {
    let result = run(json!({}));

    assert_eq!(result.mode, ExecutionMode::Records);
    assert_eq!(
        result.columns,
        vec!["id", "status", "amount", "created", "customer__name", "customer__region"]
    );
    assert_eq!(result.ordering, vec!["id"]);
    assert_eq!(result.limit, 50);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(result.rows.len(), 5);
    assert_eq!(
        Value::Object(result.rows[0].clone()),
        json!({
            "id": 1,
            "status": "paid",
            "amount": 120.0,
            "created": "2024-01-15",
            "customer__name": "Ada",
            "customer__region": "EU"
        })
    );
}

#[test]
fn test_fields_filters_and_ordering() {
    let result = run(json!({
        "fields": ["id", "customer__name"],
        "filters": {"customer__region": "EU"},
        "ordering": ["-amount"]
    }));

    assert_eq!(result.columns, vec!["id", "customer__name"]);
    assert_eq!(column(&result.rows, "id"), vec![json!(5), json!(1), json!(4), json!(3)]);
    assert_eq!(
        column(&result.rows, "customer__name"),
        vec![json!("Cyd"), json!("Ada"), json!("Cyd"), json!("Ada")]
    );
    assert!(!result.rows[0].contains_key("amount"));
}

#[test]
fn test_unlisted_fields_and_ordering_are_dropped() {
    let result = run(json!({
        "fields": ["id", "customer__email"],
        "ordering": ["customer__email", "-id"]
    }));

    assert_eq!(result.columns, vec!["id"]);
    assert_eq!(result.ordering, vec!["-id"]);
    assert_eq!(column(&result.rows, "id")[0], json!(5));
    assert_eq!(
        result.warnings,
        vec![
            "Field 'customer__email' is not available in records mode",
            "Ordering on 'customer__email' is not allowed"
        ]
    );
}

#[test]
fn test_no_usable_fields() {
    let err = engine_for(orders_dataset())
        .execute(&request(json!({"fields": ["customer__email"]})), &source(), None)
        .unwrap_err();
    assert!(matches!(err, QueryError::NoOutputFields));
}

#[test]
fn test_limit_and_offset() {
    let page = run(json!({"fields": ["id"], "limit": 2, "offset": 1}));
    assert_eq!(column(&page.rows, "id"), vec![json!(2), json!(3)]);
    assert_eq!((page.limit, page.offset), (2, 1));

    let capped = run(json!({"fields": ["id"], "limit": 500}));
    assert_eq!(capped.limit, 50);
    assert_eq!(capped.rows.len(), 5);
    assert_eq!(capped.warnings, vec!["Limit 500 exceeds the maximum of 50; using 50"]);
}

#[test]
fn test_quick_search() {
    let by_customer = run(json!({"fields": ["id"], "quick": "cy"}));
    assert_eq!(column(&by_customer.rows, "id"), vec![json!(4), json!(5)]);

    let by_status = run(json!({"fields": ["id"], "quick": "PAID", "filters": {"amount": {"lt": 150}}}));
    assert_eq!(column(&by_status.rows, "id"), vec![json!(1), json!(2)]);

    // Quick search matches are not reported as applied filters.
    assert_eq!(by_status.applied_filters.len(), 1);
}

#[test]
fn test_applied_filters_and_defaults() {
    let mut dataset = orders_dataset();
    dataset.default_filters = Some(json!({"status": {"ne": "refunded"}}));
    let result = engine_for(dataset)
        .execute(
            &request(json!({"fields": ["id"], "filters": {"amount": {"gte": 80}}})),
            &source(),
            None,
        )
        .unwrap();

    assert_eq!(column(&result.rows, "id"), vec![json!(1), json!(2), json!(5)]);
    let applied: Vec<(&str, &str)> = result
        .applied_filters
        .iter()
        .map(|spec| (spec.field.as_str(), spec.lookup.as_str()))
        .collect();
    assert_eq!(applied, vec![("status", "ne"), ("amount", "gte")]);
}

#[test]
fn test_disallowed_filter_is_reported_not_applied() {
    let result = run(json!({"fields": ["id"], "filters": {"customer__email": {"isnull": true}}}));
    assert_eq!(result.rows.len(), 5);
    assert!(result.applied_filters.is_empty());
    assert_eq!(result.warnings, vec!["Filtering on 'customer__email' is not allowed"]);
}

#[test]
fn test_pivot_ignored_outside_aggregate_mode() {
    let result = run(json!({
        "fields": ["id"],
        "pivot": {"index": "status", "columns": "id", "values": "id"}
    }));
    assert!(result.pivot.is_none());
    assert_eq!(result.warnings, vec!["Pivot is only available in aggregate mode"]);
}
