//! MySQL SQL dialect.
//!
//! MySQL differences from ANSI:
//! - Backtick identifier quoting (`` `name` ``)
//! - Boolean is TINYINT(1), returns 1/0
//! - `||` is logical OR by default (use CONCAT())
//! - No NULLS FIRST/LAST
//! - No FILTER clause (conditional aggregates use CASE)
//! - DATE_FORMAT instead of DATE_TRUNC
//! - GROUP_CONCAT only with the default separator here

use super::helpers;
use super::{DateGrain, DatePart, SqlDialect};
use crate::sql::expr::{func, lit_int, lit_str, Expr, ExprExt};

/// MySQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl SqlDialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_backtick(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_numeric(b)
    }

    fn supports_concat_operator(&self) -> bool {
        false
    }

    fn supports_nulls_ordering(&self) -> bool {
        false
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_mysql(name)
    }

    fn date_trunc(&self, grain: DateGrain, expr: Expr) -> Expr {
        let format = |f: &str, expr: Expr| func("STRFTIME", vec![expr, lit_str(f)]);
        match grain {
            DateGrain::Year => format("%Y-01-01", expr),
            DateGrain::Month => format("%Y-%m-01", expr),
            DateGrain::Day => func("DATE", vec![expr]),
            DateGrain::Hour => format("%Y-%m-%d %H:00:00", expr),
            DateGrain::Week => func(
                "SUBDATE",
                vec![func("DATE", vec![expr.clone()]), func("WEEKDAY", vec![expr])],
            ),
            DateGrain::Quarter => {
                let first_month = func("QUARTER", vec![expr.clone()])
                    .sub(lit_int(1))
                    .mul(lit_int(3))
                    .add(lit_int(1));
                func(
                    "CONCAT",
                    vec![
                        func("YEAR", vec![expr]),
                        lit_str("-"),
                        func("LPAD", vec![first_month, lit_int(2), lit_str("0")]),
                        lit_str("-01"),
                    ],
                )
            }
        }
    }

    fn date_part(&self, part: DatePart, expr: Expr) -> Expr {
        match part {
            DatePart::WeekDay => func("DAYOFWEEK", vec![expr]),
            other => helpers::extract_date_part(other, expr),
        }
    }

    fn date_only(&self, expr: Expr) -> Expr {
        func("DATE", vec![expr])
    }

    fn string_agg(&self, expr: Expr, separator: &str) -> Option<Expr> {
        (separator == ",").then(|| func("STRING_AGG", vec![expr]))
    }

    fn array_agg(&self, _expr: Expr) -> Option<Expr> {
        None
    }

    fn percentile(&self, _expr: Expr, _fraction: f64) -> Option<Expr> {
        None
    }
}
