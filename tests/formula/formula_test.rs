//! Computed-field formulas at both stages, run against the shop fixture.

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use common::source;
use mantis_query::formula::{
    compile_query_expression, evaluate_row, evaluate_row_formula, parse, parse_with_limits, FormulaError,
    FormulaLimits, FormulaValue, Stage,
};
use mantis_query::source::DataSource;
use mantis_query::sql::expr::{count_star, lit_int, sum, table_col, Expr, ExprExt};
use mantis_query::sql::{Dialect, Query, TableRef};
use serde_json::{json, Map, Value};

fn scope() -> BTreeMap<String, Expr> {
    [
        ("revenue".to_string(), sum(table_col("t0", "amount"))),
        ("orders".to_string(), count_star()),
        ("zero".to_string(), lit_int(0)),
    ]
    .into()
}

/// Runs a single query-stage formula over the whole orders table.
fn scalar(formula: &str) -> Value {
    let expr = compile_query_expression(formula, &scope()).unwrap();
    let query = Query::new()
        .select(vec![expr.alias("value")])
        .from(TableRef::new("orders").with_alias("t0"));
    let rows = source().fetch(&query).unwrap();
    rows[0]["value"].clone()
}

fn row(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

#[test]
fn test_query_stage_runs_in_sqlite() {
    assert_eq!(scalar("revenue / orders"), json!(100.0));
    assert_eq!(scalar("revenue - orders * 20"), json!(400.0));
    assert_eq!(scalar("orders ** 2"), json!(25.0));
    assert_eq!(scalar("revenue / zero"), Value::Null);
}

#[test]
fn test_query_stage_keeps_explicit_grouping() {
    let expr = compile_query_expression("revenue * (orders % 2)", &scope()).unwrap();
    insta::assert_snapshot!(expr.to_sql(Dialect::Sqlite), @r#"SUM("t0"."amount") * (COUNT(*) % 2)"#);

    assert_eq!(scalar("revenue * (orders % 2)"), json!(500.0));
    assert_eq!(scalar("revenue - (orders - 5)"), json!(500.0));
}

#[test]
fn test_query_stage_rendering_per_dialect() {
    let expr = compile_query_expression("(revenue - 10) / orders", &scope()).unwrap();
    insta::assert_snapshot!(expr.to_sql(Dialect::Postgres), @r#"((SUM("t0"."amount") - 10) * 1.0) / NULLIF(COUNT(*), 0)"#);
    insta::assert_snapshot!(expr.to_sql(Dialect::MySql), @"((SUM(`t0`.`amount`) - 10) * 1.0) / NULLIF(COUNT(*), 0)");
}

#[test]
fn test_query_stage_rejections() {
    assert_eq!(
        compile_query_expression("revenue / cost", &scope()),
        Err(FormulaError::UnknownName("cost".to_string()))
    );
    assert_eq!(
        compile_query_expression("revenue and orders", &scope()),
        Err(FormulaError::Disallowed("boolean operator"))
    );
    assert!(matches!(
        compile_query_expression("revenue +", &scope()),
        Err(FormulaError::Syntax(_))
    ));
}

#[test]
fn test_row_stage_evaluation() {
    let context = row(json!({"revenue": 120.0, "orders": 3, "region": "EU", "label": null}));

    assert_eq!(
        evaluate_row_formula("revenue / orders", &context),
        Ok(FormulaValue::Float(40.0))
    );
    assert_eq!(
        evaluate_row_formula("region == 'EU' and orders >= 3", &context),
        Ok(FormulaValue::Bool(true))
    );
    assert_eq!(
        evaluate_row_formula("label == None", &context),
        Ok(FormulaValue::Bool(true))
    );
    assert_eq!(
        evaluate_row_formula("region + '-' + region", &context),
        Ok(FormulaValue::Str("EU-EU".to_string()))
    );
    assert_eq!(evaluate_row_formula("unknown * 2", &context), Ok(FormulaValue::Int(0)));
}

#[test]
fn test_long_formulas_fail_cleanly() {
    let context = row(json!({"a": 1}));
    let long = vec!["a"; 20_000].join(" + ");
    assert_eq!(
        evaluate_row_formula(&long, &context),
        Err(FormulaError::TooLong {
            length: long.len(),
            max: 1000
        })
    );

    let limits = FormulaLimits {
        max_length: 100_000,
        max_depth: 64,
    };
    assert_eq!(parse_with_limits(&long, &limits), Err(FormulaError::TooDeep { max: 64 }));
    let deep = format!("{}a{}", "(".repeat(5_000), ")".repeat(5_000));
    assert_eq!(parse_with_limits(&deep, &limits), Err(FormulaError::TooDeep { max: 64 }));
    assert_eq!(
        evaluate_row(&parse_with_limits("a + a + a", &limits).unwrap(), &context),
        Ok(FormulaValue::Int(3))
    );
}

#[test]
fn test_parsed_formula_reused_across_rows() {
    let expr = parse("revenue / orders").unwrap();
    let results: Vec<Value> = [json!({"revenue": 10, "orders": 4}), json!({"revenue": 10, "orders": 0})]
        .into_iter()
        .map(|r| match evaluate_row(&expr, &row(r)) {
            Ok(value) => value.into_json(),
            Err(e) => json!(e.to_string()),
        })
        .collect();
    assert_eq!(results, vec![json!(2.5), json!("Division by zero")]);
}

#[test]
fn test_escape_hatches_are_rejected() {
    let context = Map::new();
    let attempts = [
        ("__import__('os').system('id')", "call"),
        ("open('/etc/passwd')", "call"),
        ("revenue.__class__", "attribute access"),
        ("rows[0]", "subscript"),
    ];
    for (formula, kind) in attempts {
        assert_eq!(
            evaluate_row_formula(formula, &context),
            Err(FormulaError::Disallowed(kind)),
            "{}",
            formula
        );
    }

    assert_eq!(
        parse("__class__ * 2").unwrap().check(Stage::Row),
        Err(FormulaError::ForbiddenName("__class__".to_string()))
    );
    assert!(parse("__class__ * 2").unwrap().check(Stage::Query).is_err());
}
