//! Filter trees compiled and executed against the shop fixture.

#[path = "../common/mod.rs"]
mod common;

use common::{catalog, orders_dataset, source, today};
use mantis_query::filter::{CompiledFilter, FilterCompiler, FilterNode};
use mantis_query::model::Catalog;
use mantis_query::source::{DataSource, SqliteSource};
use mantis_query::sql::expr::{table_col, ExprExt};
use mantis_query::sql::{Dialect, OrderByExpr, Query, TableRef};
use serde_json::{json, Value};

fn tree(value: Value) -> FilterNode {
    let mut warnings = Vec::new();
    let node = FilterNode::parse(&value, &mut warnings);
    assert!(warnings.is_empty(), "{:?}", warnings);
    node
}

fn compiler(catalog: &Catalog) -> FilterCompiler<'_> {
    FilterCompiler::new(catalog, Dialect::Sqlite, "orders")
        .with_subqueries([("customers".to_string(), vec!["id".to_string(), "region".to_string()])].into())
        .with_today(today())
}

/// Order ids matching the compiled predicate, ascending.
fn ids(source: &SqliteSource, compiled: &CompiledFilter) -> Vec<i64> {
    let mut query = Query::new()
        .select(vec![table_col("t0", "id").alias("id")])
        .from(TableRef::new("orders").with_alias("t0"));
    query.joins = compiled.joins.clone();
    if let Some(predicate) = &compiled.predicate {
        query = query.filter(predicate.clone());
    }
    let query = query.order_by(vec![OrderByExpr::asc(table_col("t0", "id"))]);

    source
        .fetch(&query)
        .unwrap()
        .iter()
        .map(|row| row["id"].as_i64().unwrap())
        .collect()
}

fn matching(filter: Value) -> Vec<i64> {
    let catalog = catalog();
    let compiled = compiler(&catalog).compile(&tree(filter));
    assert!(compiled.warnings.is_empty(), "{:?}", compiled.warnings);
    ids(&source(), &compiled)
}

#[test]
fn test_comparisons() {
    assert_eq!(matching(json!({"status": "paid"})), vec![1, 2, 5]);
    assert_eq!(matching(json!({"status": {"in": ["open", "refunded"]}})), vec![3, 4]);
    assert_eq!(matching(json!({"amount": {"range": [60, 120]}})), vec![1, 2, 4]);
    assert_eq!(matching(json!({"amount": {"gt": 50, "lt": 100}})), vec![2, 4]);
    assert_eq!(matching(json!({"status": {"ne": "paid"}})), vec![3, 4]);
}

#[test]
fn test_lookups_in_keys() {
    assert_eq!(matching(json!({"amount__gte": 100})), vec![1, 5]);
    assert_eq!(matching(json!({"customer__region__in": ["US"]})), vec![2]);
    assert_eq!(matching(json!({"lines__count__gte": 2})), vec![1]);
    assert_eq!(
        matching(json!({"amount__lt": 100, "status": "paid"})),
        matching(json!({"amount": {"lt": 100}, "status": "paid"}))
    );
}

#[test]
fn test_branches() {
    assert_eq!(
        matching(json!({"OR": [{"status": "open"}, {"amount": {"gt": 150}}]})),
        vec![3, 5]
    );
    assert_eq!(matching(json!({"NOT": {"status": "paid"}})), vec![3, 4]);
    assert_eq!(
        matching(json!([
            {"field": "status", "value": "open"},
            {"field": "status", "value": "refunded", "connector": "or"}
        ])),
        vec![3, 4]
    );
}

#[test]
fn test_related_fields_join_once() {
    let catalog = catalog();
    let compiled = compiler(&catalog).compile(&tree(json!({
        "customer__region": "EU",
        "customer__name": {"istartswith": "c"},
        "amount": {"gte": 100}
    })));
    assert_eq!(compiled.joins.len(), 1);
    assert_eq!(ids(&source(), &compiled), vec![5]);

    insta::assert_snapshot!(compiled.predicate.unwrap().to_sql(Dialect::Postgres), @r#""t0"."amount" >= 100 AND LOWER("t1"."name") LIKE 'c%' ESCAPE '\' AND "t1"."region" = 'EU'"#);
}

#[test]
fn test_text_lookups() {
    assert_eq!(matching(json!({"customer__name": {"icontains": "CY"}})), vec![4, 5]);
    assert_eq!(matching(json!({"customer__email": {"isnull": true}})), vec![2]);
    assert_eq!(matching(json!({"customer__email": {"regex": "\\.org$"}})), vec![4, 5]);
    assert_eq!(matching(json!({"customer__email": {"iregex": "^ADA@"}})), vec![1, 3]);
    assert_eq!(matching(json!({"status": {"search": "PA id"}})), vec![1, 2, 5]);
}

#[test]
fn test_like_wildcards_are_literal() {
    assert!(matching(json!({"status": {"contains": "%"}})).is_empty());
    assert!(matching(json!({"status": {"contains": "_"}})).is_empty());
}

#[test]
fn test_date_lookups() {
    assert_eq!(matching(json!({"created": {"month": 2}})), vec![2, 3]);
    assert_eq!(matching(json!({"created": {"year__gte": 2024}})), vec![1, 2, 3, 4, 5]);
    assert_eq!(matching(json!({"created": {"this_month": true}})), vec![4, 5]);
    assert_eq!(matching(json!({"created": {"this_month": false}})), vec![1, 2, 3]);
    assert_eq!(matching(json!({"created": {"past_days": 10}})), vec![5]);
}

#[test]
fn test_quantifiers_over_lines() {
    assert_eq!(matching(json!({"lines": {"some": {"sku": "A-1"}}})), vec![1, 2, 5]);
    assert_eq!(matching(json!({"lines": {"none": {"sku": "A-1"}}})), vec![3, 4]);
    // Order 4 has no lines, so every line trivially qualifies.
    assert_eq!(
        matching(json!({"lines": {"every": {"quantity": {"gte": 2}}}})),
        vec![2, 4, 5]
    );
    assert_eq!(
        matching(json!({"lines": {"count": {"gte": 2, "filter": {"quantity": {"gte": 1}}}}})),
        vec![1]
    );
    assert_eq!(matching(json!({"lines__sku": "C-3"})), vec![3]);
}

#[test]
fn test_history_window_and_subquery() {
    assert_eq!(matching(json!({"status": {"was": {"value": "open"}}})), vec![1, 5]);
    assert_eq!(
        matching(json!({"amount": {"window": {"partition_by": "customer_id", "lte": 1}}})),
        vec![1, 2, 5]
    );
    assert_eq!(
        matching(json!({
            "customer_id": {"in_subquery": {"entity": "customers", "field": "id", "filter": {"region": "US"}}}
        })),
        vec![2]
    );
}

#[test]
fn test_dataset_policy_drops_undeclared_fields() {
    let catalog = catalog();
    let dataset = orders_dataset();
    let compiler = FilterCompiler::for_dataset(&catalog, Dialect::Sqlite, &dataset).with_today(today());
    let compiled = compiler.compile(&tree(json!({"status": "paid", "customer__email": {"isnull": true}})));

    assert_eq!(compiled.warnings, vec!["Filtering on 'customer__email' is not allowed"]);
    assert_eq!(compiled.specs.len(), 1);
    assert_eq!(ids(&source(), &compiled), vec![1, 2, 5]);
}

#[test]
fn test_injection_attempts_stay_literals() {
    let source = source();
    let catalog = catalog();
    let compiled = compiler(&catalog).compile(&tree(json!({
        "status": "paid' OR '1'='1",
        "customer__name": {"icontains": "'; DROP TABLE orders; --"}
    })));
    assert!(ids(&source, &compiled).is_empty());

    // The table is still there.
    let all = compiler(&catalog).compile(&FilterNode::default());
    assert_eq!(ids(&source, &all).len(), 5);
}

#[test]
fn test_mysql_rendering() {
    let catalog = catalog();
    let compiled = FilterCompiler::new(&catalog, Dialect::MySql, "orders")
        .compile(&tree(json!({"status": {"iexact": "Paid"}, "amount": {"lt": 10.5}})));
    insta::assert_snapshot!(compiled.predicate.unwrap().to_sql(Dialect::MySql), @"`t0`.`amount` < 10.5 AND LOWER(`t0`.`status`) = 'paid'");
}
