//! DuckDB SQL dialect.
//!
//! DuckDB is largely PostgreSQL-compatible:
//! - ANSI identifier quoting (`"`)
//! - Native boolean type (true/false)
//! - FILTER clause for aggregates
//! - REGEXP_MATCHES instead of REGEXP_LIKE
//! - QUANTILE_CONT for percentiles

use super::helpers;
use super::SqlDialect;
use crate::sql::expr::{func, lit_float, lit_str, Expr};

#[derive(Debug, Clone, Copy)]
pub struct DuckDb;

impl SqlDialect for DuckDb {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    fn supports_aggregate_filter(&self) -> bool {
        true
    }

    fn regex_match(&self, expr: Expr, pattern: &str, case_insensitive: bool) -> Expr {
        let mut args = vec![expr, lit_str(pattern)];
        if case_insensitive {
            args.push(lit_str("i"));
        }
        func("REGEXP_MATCHES", args)
    }

    fn percentile(&self, expr: Expr, fraction: f64) -> Option<Expr> {
        Some(func("QUANTILE_CONT", vec![expr, lit_float(fraction)]))
    }
}
