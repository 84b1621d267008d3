//! SQLite SQL dialect.
//!
//! SQLite differences from PostgreSQL:
//! - Dates are ISO-8601 text; truncation and extraction go through STRFTIME
//! - Booleans are integers (1/0)
//! - OFFSET requires a LIMIT (`LIMIT -1` is unbounded)
//! - REGEXP is a user function, registered by the SQLite data source
//! - No percentile, array or statistical aggregates

use super::helpers;
use super::{DateGrain, DatePart, SqlDialect};
use crate::sql::expr::{func, lit_int, lit_str, Expr, ExprExt};
use crate::sql::token::TokenStream;

#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_numeric(b)
    }

    fn format_date_literal(&self, date: &str) -> String {
        helpers::quote_string_single(date)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_sqlite(limit, offset)
    }

    fn supports_aggregate_filter(&self) -> bool {
        true
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_sqlite(name)
    }

    fn date_trunc(&self, grain: DateGrain, expr: Expr) -> Expr {
        let strftime = |format: &str, expr: Expr| func("STRFTIME", vec![lit_str(format), expr]);
        match grain {
            DateGrain::Year => strftime("%Y-01-01", expr),
            DateGrain::Month => strftime("%Y-%m-01", expr),
            DateGrain::Day => func("DATE", vec![expr]),
            DateGrain::Hour => strftime("%Y-%m-%d %H:00:00", expr),
            // Monday of the containing week.
            DateGrain::Week => func(
                "DATE",
                vec![expr, lit_str("-6 days"), lit_str("weekday 1")],
            ),
            DateGrain::Quarter => {
                let first_month = helpers::strftime_int("%m", expr.clone())
                    .sub(lit_int(1))
                    .div(lit_int(3))
                    .mul(lit_int(3))
                    .add(lit_int(1));
                func(
                    "PRINTF",
                    vec![
                        lit_str("%s-%02d-01"),
                        strftime("%Y", expr),
                        first_month,
                    ],
                )
            }
        }
    }

    fn date_part(&self, part: DatePart, expr: Expr) -> Expr {
        match part {
            DatePart::Year => helpers::strftime_int("%Y", expr),
            DatePart::Month => helpers::strftime_int("%m", expr),
            DatePart::Day => helpers::strftime_int("%d", expr),
            DatePart::Hour => helpers::strftime_int("%H", expr),
            DatePart::Minute => helpers::strftime_int("%M", expr),
            DatePart::Week => helpers::strftime_int("%W", expr),
            DatePart::WeekDay => helpers::strftime_int("%w", expr).add(lit_int(1)),
            DatePart::Quarter => helpers::strftime_int("%m", expr)
                .add(lit_int(2))
                .div(lit_int(3)),
        }
    }

    fn date_only(&self, expr: Expr) -> Expr {
        func("DATE", vec![expr])
    }

    fn regex_match(&self, expr: Expr, pattern: &str, case_insensitive: bool) -> Expr {
        let pattern = if case_insensitive {
            format!("(?i){}", pattern)
        } else {
            pattern.to_string()
        };
        func("REGEXP", vec![lit_str(&pattern), expr])
    }

    fn array_agg(&self, _expr: Expr) -> Option<Expr> {
        None
    }

    fn percentile(&self, _expr: Expr, _fraction: f64) -> Option<Expr> {
        None
    }

    fn stddev(&self, _expr: Expr) -> Option<Expr> {
        None
    }

    fn variance(&self, _expr: Expr) -> Option<Expr> {
        None
    }
}
