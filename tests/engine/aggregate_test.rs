//! Aggregate mode end to end: grouping, metric filters, HAVING, computed
//! fields and pivots.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{catalog, column, engine_for, engine_with, orders_dataset, request, source, today};
use mantis_query::config::Settings;
use mantis_query::engine::{DatasetEngine, SchemaContext};
use mantis_query::model::{DatasetDefinition, ExecutionMode, ExecutionResult};
use mantis_query::sql::Dialect;
use mantis_query::QueryError;
use serde_json::{json, Value};

fn run_with(dataset: DatasetDefinition, payload: Value) -> ExecutionResult {
    engine_for(dataset)
        .execute(&request(payload), &source(), None)
        .unwrap()
}

fn run(payload: Value) -> ExecutionResult {
    run_with(orders_dataset(), payload)
}

fn ad_hoc_dataset() -> DatasetDefinition {
    let mut dataset = orders_dataset();
    dataset.metadata.allow_ad_hoc = true;
    dataset
}

fn engine_in(dialect: Dialect) -> DatasetEngine {
    let context = Arc::new(SchemaContext::new(catalog(), dialect));
    DatasetEngine::new(orders_dataset(), context, Settings::default()).with_today(today())
}

#[test]
fn test_group_by_status() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["status"],
        "metrics": ["revenue", "orders", "paid_orders"],
        "ordering": ["status"]
    }));

    assert_eq!(result.mode, ExecutionMode::Aggregate);
    assert_eq!(
        result.columns,
        vec!["status", "revenue", "orders", "paid_orders", "avg_order"]
    );
    assert_eq!(
        column(&result.rows, "status"),
        vec![json!("open"), json!("paid"), json!("refunded")]
    );
    assert_eq!(
        column(&result.rows, "revenue"),
        vec![json!(40.0), json!(400.0), json!(60.0)]
    );
    assert_eq!(column(&result.rows, "orders"), vec![json!(1), json!(3), json!(1)]);
    assert_eq!(column(&result.rows, "paid_orders"), vec![json!(0), json!(3), json!(0)]);
    assert_eq!(result.rows[0]["avg_order"], json!(40.0));
    assert_eq!(result.rows[2]["avg_order"], json!(60.0));
}

#[test]
fn test_dimension_through_relation() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["region"],
        "metrics": ["revenue"],
        "ordering": ["-revenue"]
    }));

    assert_eq!(column(&result.rows, "region"), vec![json!("EU"), json!("US")]);
    assert_eq!(column(&result.rows, "revenue"), vec![json!(420.0), json!(80.0)]);
    // avg_order needs the orders metric.
    assert_eq!(result.columns, vec!["region", "revenue"]);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].starts_with("Computed field 'avg_order' dropped"));
}

#[test]
fn test_month_buckets() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["created_month"],
        "metrics": ["orders"],
        "ordering": ["created_month"]
    }));

    assert_eq!(
        column(&result.rows, "created_month"),
        vec![json!("2024-01-01"), json!("2024-02-01"), json!("2024-03-01")]
    );
    assert_eq!(column(&result.rows, "orders"), vec![json!(1), json!(2), json!(2)]);
}

#[test]
fn test_grand_total_without_dimensions() {
    let total = run(json!({"mode": "aggregate", "dimensions": [], "metrics": ["revenue"]}));
    assert_eq!(total.columns, vec!["revenue"]);
    assert_eq!(total.rows.len(), 1);
    assert_eq!(total.rows[0]["revenue"], json!(500.0));

    let paid = run(json!({
        "mode": "aggregate",
        "dimensions": [],
        "metrics": ["revenue", "orders"],
        "filters": {"status": "paid"}
    }));
    assert_eq!(paid.rows.len(), 1);
    assert_eq!(paid.rows[0]["revenue"], json!(400.0));
    assert_eq!(paid.rows[0]["orders"], json!(3));
    assert_eq!(paid.rows[0]["avg_order"], json!(400.0 / 3.0));

    let ad_hoc = run_with(
        ad_hoc_dataset(),
        json!({
            "mode": "aggregate",
            "dimensions": [],
            "metrics": [{"name": "total", "field": "amount", "aggregation": "sum"}],
            "computed_fields": []
        }),
    );
    assert_eq!(ad_hoc.columns, vec!["total"]);
    assert_eq!(column(&ad_hoc.rows, "total"), vec![json!(500.0)]);
}

#[test]
fn test_to_many_metrics_leave_other_metrics_intact() {
    let total = run_with(
        ad_hoc_dataset(),
        json!({
            "mode": "aggregate",
            "dimensions": [],
            "metrics": ["revenue", {"field": "lines", "aggregation": "count"}]
        }),
    );
    assert_eq!(total.rows.len(), 1);
    assert_eq!(total.rows[0]["revenue"], json!(500.0));
    assert_eq!(total.rows[0]["lines_count"], json!(5));

    let by_status = run_with(
        ad_hoc_dataset(),
        json!({
            "mode": "aggregate",
            "dimensions": ["status"],
            "metrics": [
                "revenue",
                {"field": "lines", "aggregation": "count"},
                {"field": "lines__price", "aggregation": "sum", "name": "line_value"}
            ],
            "ordering": ["status"]
        }),
    );
    assert_eq!(
        column(&by_status.rows, "revenue"),
        vec![json!(40.0), json!(400.0), json!(60.0)]
    );
    assert_eq!(
        column(&by_status.rows, "lines_count"),
        vec![json!(1), json!(4), json!(0)]
    );
    assert_eq!(
        column(&by_status.rows, "line_value"),
        vec![json!(40.0), json!(130.0), Value::Null]
    );
}

#[test]
fn test_where_and_having() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["status"],
        "metrics": ["revenue", "orders"],
        "filters": {"amount": {"gte": 60}},
        "having": {"orders": {"gte": 2}}
    }));

    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["status"], json!("paid"));
    assert_eq!(result.rows[0]["revenue"], json!(400.0));
    assert_eq!(result.applied_filters.len(), 1);
}

#[test]
fn test_having_on_unknown_alias_is_ignored() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["status"],
        "metrics": ["orders"],
        "having": {"amount": {"gt": 1}}
    }));
    assert_eq!(result.rows.len(), 3);
    assert!(!result.warnings.is_empty());
}

#[test]
fn test_ad_hoc_metric_with_filter() {
    let result = run_with(
        ad_hoc_dataset(),
        json!({
            "mode": "aggregate",
            "dimensions": ["status"],
            "metrics": [
                {"field": "amount", "aggregation": "sum", "name": "eu_revenue", "filter": {"customer__region": "EU"}},
                {"field": "amount", "aggregation": "max"}
            ],
            "ordering": ["status"]
        }),
    );

    assert_eq!(result.columns, vec!["status", "eu_revenue", "amount_max"]);
    assert_eq!(
        column(&result.rows, "eu_revenue"),
        vec![json!(40.0), json!(320.0), json!(60.0)]
    );
    assert_eq!(
        column(&result.rows, "amount_max"),
        vec![json!(40.0), json!(200.0), json!(60.0)]
    );
}

#[test]
fn test_ad_hoc_definitions_need_permission() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["status"],
        "metrics": ["orders", {"field": "amount", "aggregation": "max"}]
    }));
    assert_eq!(result.columns, vec!["status", "orders"]);
    assert!(result
        .warnings
        .contains(&"Ad-hoc metric definitions are not allowed for this dataset".to_string()));
}

#[test]
fn test_row_stage_computed_fields() {
    let result = run_with(
        ad_hoc_dataset(),
        json!({
            "mode": "aggregate",
            "dimensions": ["status"],
            "metrics": ["revenue", "paid_orders"],
            "computed_fields": [
                {"name": "big", "formula": "revenue > 100"},
                {"name": "per_paid", "formula": "revenue / paid_orders"},
                {"name": "escape", "formula": "__import__('os')"}
            ],
            "ordering": ["status"]
        }),
    );

    assert_eq!(
        result.columns,
        vec!["status", "revenue", "paid_orders", "big", "per_paid", "escape"]
    );
    assert_eq!(column(&result.rows, "big"), vec![json!(false), json!(true), json!(false)]);
    assert_eq!(
        column(&result.rows, "per_paid"),
        vec![Value::Null, json!(400.0 / 3.0), Value::Null]
    );
    assert_eq!(column(&result.rows, "escape"), vec![Value::Null; 3]);
    assert_eq!(
        result.warnings,
        vec![
            "Computed field 'escape' will be null: Unsupported expression in formula: call",
            "Computed field 'per_paid' failed on row 0: Division by zero",
            "Computed field 'per_paid' failed on row 2: Division by zero",
        ]
    );
}

#[test]
fn test_oversized_formulas_are_rejected_before_parsing() {
    let long = vec!["revenue"; 300].join(" + ");
    let result = run_with(
        ad_hoc_dataset(),
        json!({
            "mode": "aggregate",
            "dimensions": ["status"],
            "metrics": ["revenue"],
            "computed_fields": [
                {"name": "summed", "formula": long, "stage": "query"},
                {"name": "row_sum", "formula": long}
            ],
            "ordering": ["status"]
        }),
    );

    let reason = format!("Formula is {} characters long (maximum 1000)", long.len());
    assert_eq!(result.columns, vec!["status", "revenue", "row_sum"]);
    assert_eq!(column(&result.rows, "row_sum"), vec![Value::Null; 3]);
    assert_eq!(
        result.warnings,
        vec![
            format!("Computed field 'summed' dropped: {}", reason),
            format!("Computed field 'row_sum' will be null: {}", reason),
        ]
    );
}

#[test]
fn test_formula_limits_follow_settings() {
    let mut settings = Settings::default();
    settings.security.max_formula_depth = 3;
    let mut dataset = ad_hoc_dataset();
    dataset.computed_fields.clear();
    let result = engine_with(dataset, settings)
        .execute(
            &request(json!({
                "mode": "aggregate",
                "dimensions": ["status"],
                "metrics": ["revenue"],
                "computed_fields": [
                    {"name": "twice", "formula": "revenue * 2", "stage": "query"},
                    {"name": "nested", "formula": "((((revenue * 2))))", "stage": "query"}
                ],
                "ordering": ["status"]
            })),
            &source(),
            None,
        )
        .unwrap();

    assert_eq!(result.columns, vec!["status", "revenue", "twice"]);
    assert_eq!(
        result.warnings,
        vec!["Computed field 'nested' dropped: Formula nesting exceeds the maximum depth of 3"]
    );
}

#[test]
fn test_pivot() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["created_month", "region"],
        "metrics": ["orders"],
        "ordering": ["created_month", "region"],
        "pivot": {"index": "created_month", "columns": "region", "values": "orders"}
    }));

    let pivot = result.pivot.expect("pivot table");
    assert_eq!(
        pivot.index_values,
        vec![json!("2024-01-01"), json!("2024-02-01"), json!("2024-03-01")]
    );
    assert_eq!(pivot.column_values, vec![json!("EU"), json!("US")]);
    let rows: Vec<Value> = pivot.rows.into_iter().map(Value::Object).collect();
    assert_eq!(
        rows,
        vec![
            json!({"created_month": "2024-01-01", "EU__orders": 1, "US__orders": null}),
            json!({"created_month": "2024-02-01", "EU__orders": 1, "US__orders": 1}),
            json!({"created_month": "2024-03-01", "EU__orders": 2, "US__orders": null}),
        ]
    );
    // The flat rows are still returned.
    assert_eq!(result.rows.len(), 4);
}

#[test]
fn test_malformed_pivot_is_ignored() {
    let result = run(json!({
        "mode": "aggregate",
        "dimensions": ["status"],
        "metrics": ["orders"],
        "pivot": {"index": "status", "columns": 3, "values": "orders"}
    }));
    assert!(result.pivot.is_none());
    assert!(result
        .warnings
        .contains(&"Pivot ignored: 'columns' must be a string naming an output column".to_string()));
}

#[test]
fn test_declared_metric_over_unknown_field_fails() {
    let mut dataset = orders_dataset();
    dataset.metrics[0].field = Some("discount".to_string());
    let err = engine_for(dataset)
        .execute(&request(json!({"mode": "aggregate", "dimensions": ["status"]})), &source(), None)
        .unwrap_err();
    assert!(matches!(err, QueryError::Catalog(_)), "{}", err);
}

#[test]
fn test_postgres_rendering() {
    let plan = engine_in(Dialect::Postgres)
        .plan(&request(json!({
            "mode": "aggregate",
            "dimensions": ["region", "created_month"],
            "metrics": ["paid_orders"],
            "ordering": ["-paid_orders"]
        })))
        .unwrap();

    insta::assert_snapshot!(plan.query.to_sql(Dialect::Postgres), @r#"
    SELECT
      "t1"."region" AS "region",
      DATE_TRUNC('month', "t0"."created") AS "created_month",
      COUNT(*) FILTER (WHERE "t0"."status" = 'paid') AS "paid_orders"
    FROM "orders" AS "t0"
    LEFT JOIN "customers" AS "t1" ON "t0"."customer_id" = "t1"."id"
    GROUP BY "t1"."region", DATE_TRUNC('month', "t0"."created")
    ORDER BY "paid_orders" DESC
    LIMIT 50
    "#);
}

#[test]
fn test_mysql_rendering() {
    let plan = engine_in(Dialect::MySql)
        .plan(&request(json!({
            "mode": "aggregate",
            "dimensions": ["status"],
            "metrics": ["revenue", "orders", "paid_orders"]
        })))
        .unwrap();
    let sql = plan.query.to_sql(Dialect::MySql);

    assert!(sql.contains("SUM(`t0`.`amount`) AS `revenue`"), "{}", sql);
    assert!(
        sql.contains("COUNT(CASE WHEN `t0`.`status` = 'paid' THEN 1 END) AS `paid_orders`"),
        "{}",
        sql
    );
    assert!(
        sql.contains("(SUM(`t0`.`amount`) * 1.0) / NULLIF(COUNT(*), 0) AS `avg_order`"),
        "{}",
        sql
    );
}
