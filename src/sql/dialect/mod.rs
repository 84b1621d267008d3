//! SQL Dialect definitions and formatting rules.
//!
//! This module provides a trait-based abstraction for SQL dialect differences.
//! Each dialect implements `SqlDialect` to handle its specific syntax:
//!
//! - Identifier quoting: `"` (SQLite/PG/DuckDB), `` ` `` (MySQL)
//! - Pagination: SQLite needs `LIMIT -1` before a bare OFFSET
//! - Boolean literals: true/false vs 1/0
//! - Date truncation and extraction: `DATE_TRUNC`/`EXTRACT` vs `STRFTIME`
//! - Regex matching and the optional aggregate functions
//!
//! The aggregation capabilities (`string_agg`, `percentile`, ...) return
//! `None` when the backend cannot express them, which is how the engine
//! decides which aggregations a schema context offers.
//!
//! | Feature | SQLite | PostgreSQL | DuckDB | MySQL |
//! |---------|--------|------------|--------|-------|
//! | FILTER (WHERE) | 3.30+ | 9.4+ | ✓ | ❌ |
//! | NULLS FIRST/LAST | 3.30+ | ✓ | ✓ | ❌ |
//! | ARRAY_AGG | ❌ | ✓ | ✓ | ❌ |
//! | Percentile | ❌ | ✓ | ✓ | ❌ |
//! | STDDEV/VARIANCE | ❌ | ✓ | ✓ | ✓ |

mod duckdb;
pub mod helpers;
mod mysql;
mod postgres;
mod sqlite;

pub use duckdb::DuckDb;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use serde::{Deserialize, Serialize};

use super::expr::{cast, func, lit_float, lit_str, CastType, Expr};
use super::token::TokenStream;

/// Truncation grains for `trunc` dimension transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateGrain {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Hour,
}

impl DateGrain {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "year" => Some(DateGrain::Year),
            "quarter" => Some(DateGrain::Quarter),
            "month" => Some(DateGrain::Month),
            "week" => Some(DateGrain::Week),
            "day" => Some(DateGrain::Day),
            "hour" => Some(DateGrain::Hour),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DateGrain::Year => "year",
            DateGrain::Quarter => "quarter",
            DateGrain::Month => "month",
            DateGrain::Week => "week",
            DateGrain::Day => "day",
            DateGrain::Hour => "hour",
        }
    }
}

/// Date parts for `extract` transforms and date lookups.
///
/// `WeekDay` numbers Sunday as 1 through Saturday as 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    WeekDay,
    Hour,
    Minute,
}

impl DatePart {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "year" => Some(DatePart::Year),
            "quarter" => Some(DatePart::Quarter),
            "month" => Some(DatePart::Month),
            "week" => Some(DatePart::Week),
            "day" => Some(DatePart::Day),
            "week_day" => Some(DatePart::WeekDay),
            "hour" => Some(DatePart::Hour),
            "minute" => Some(DatePart::Minute),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatePart::Year => "year",
            DatePart::Quarter => "quarter",
            DatePart::Month => "month",
            DatePart::Week => "week",
            DatePart::Day => "day",
            DatePart::WeekDay => "week_day",
            DatePart::Hour => "hour",
            DatePart::Minute => "minute",
        }
    }
}

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// The default implementations follow PostgreSQL where possible.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    fn quote_identifier(&self, ident: &str) -> String;

    /// All dialects use single quotes with `''` for escaping.
    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    fn format_bool(&self, b: bool) -> &'static str;

    fn format_null(&self) -> &'static str {
        "NULL"
    }

    /// `DATE '2024-01-31'` by default; datetimes keep the TIMESTAMP keyword.
    fn format_date_literal(&self, date: &str) -> String {
        if date.len() > 10 {
            format!("TIMESTAMP {}", helpers::quote_string_single(date))
        } else {
            format!("DATE {}", helpers::quote_string_single(date))
        }
    }

    // =========================================================================
    // Pagination
    // =========================================================================

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_standard(limit, offset)
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// MySQL uses `||` as logical OR by default.
    fn supports_concat_operator(&self) -> bool {
        true
    }

    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    /// Whether `AGG(x) FILTER (WHERE ...)` is available; otherwise the
    /// engine falls back to `AGG(CASE WHEN ... THEN x END)`.
    fn supports_aggregate_filter(&self) -> bool {
        false
    }

    /// Returns `Some(new_name)` if the function should be remapped.
    fn remap_function(&self, name: &str) -> Option<&'static str> {
        let _ = name;
        None
    }

    // =========================================================================
    // Date/Time
    // =========================================================================

    fn date_trunc(&self, grain: DateGrain, expr: Expr) -> Expr {
        func("DATE_TRUNC", vec![lit_str(grain.as_str()), expr])
    }

    fn date_part(&self, part: DatePart, expr: Expr) -> Expr {
        helpers::extract_date_part(part, expr)
    }

    /// The calendar date of a date or datetime value.
    fn date_only(&self, expr: Expr) -> Expr {
        cast(expr, CastType::Date)
    }

    // =========================================================================
    // Pattern Matching
    // =========================================================================

    fn regex_match(&self, expr: Expr, pattern: &str, case_insensitive: bool) -> Expr {
        let mut args = vec![expr, lit_str(pattern)];
        if case_insensitive {
            args.push(lit_str("i"));
        }
        func("REGEXP_LIKE", args)
    }

    // =========================================================================
    // Optional Aggregates
    // =========================================================================

    fn string_agg(&self, expr: Expr, separator: &str) -> Option<Expr> {
        Some(func("STRING_AGG", vec![expr, lit_str(separator)]))
    }

    fn array_agg(&self, expr: Expr) -> Option<Expr> {
        Some(func("ARRAY_AGG", vec![expr]))
    }

    /// Continuous percentile, `fraction` in `[0, 1]`.
    fn percentile(&self, expr: Expr, fraction: f64) -> Option<Expr> {
        Some(Expr::WithinGroup {
            function: Box::new(func("PERCENTILE_CONT", vec![lit_float(fraction)])),
            order_by: Box::new(expr),
        })
    }

    fn stddev(&self, expr: Expr) -> Option<Expr> {
        Some(func("STDDEV_SAMP", vec![expr]))
    }

    fn variance(&self, expr: Expr) -> Option<Expr> {
        Some(func("VAR_SAMP", vec![expr]))
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
    DuckDb,
    MySql,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Sqlite => &Sqlite,
            Dialect::Postgres => &Postgres,
            Dialect::DuckDb => &DuckDb,
            Dialect::MySql => &MySql,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Some(Dialect::Sqlite),
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "duckdb" => Some(Dialect::DuckDb),
            "mysql" => Some(Dialect::MySql),
            _ => None,
        }
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        self.dialect().format_bool(b)
    }

    fn format_null(&self) -> &'static str {
        self.dialect().format_null()
    }

    fn format_date_literal(&self, date: &str) -> String {
        self.dialect().format_date_literal(date)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        self.dialect().emit_limit_offset(limit, offset)
    }

    fn concat_operator(&self) -> &'static str {
        self.dialect().concat_operator()
    }

    fn supports_concat_operator(&self) -> bool {
        self.dialect().supports_concat_operator()
    }

    fn supports_nulls_ordering(&self) -> bool {
        self.dialect().supports_nulls_ordering()
    }

    fn supports_aggregate_filter(&self) -> bool {
        self.dialect().supports_aggregate_filter()
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        self.dialect().remap_function(name)
    }

    fn date_trunc(&self, grain: DateGrain, expr: Expr) -> Expr {
        self.dialect().date_trunc(grain, expr)
    }

    fn date_part(&self, part: DatePart, expr: Expr) -> Expr {
        self.dialect().date_part(part, expr)
    }

    fn date_only(&self, expr: Expr) -> Expr {
        self.dialect().date_only(expr)
    }

    fn regex_match(&self, expr: Expr, pattern: &str, case_insensitive: bool) -> Expr {
        self.dialect().regex_match(expr, pattern, case_insensitive)
    }

    fn string_agg(&self, expr: Expr, separator: &str) -> Option<Expr> {
        self.dialect().string_agg(expr, separator)
    }

    fn array_agg(&self, expr: Expr) -> Option<Expr> {
        self.dialect().array_agg(expr)
    }

    fn percentile(&self, expr: Expr, fraction: f64) -> Option<Expr> {
        self.dialect().percentile(expr, fraction)
    }

    fn stddev(&self, expr: Expr) -> Option<Expr> {
        self.dialect().stddev(expr)
    }

    fn variance(&self, expr: Expr) -> Option<Expr> {
        self.dialect().variance(expr)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}
