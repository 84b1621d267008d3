//! Shared helper functions for SQL dialect implementations.
//!
//! This module provides reusable building blocks that dialects can compose
//! to implement the `SqlDialect` trait with minimal duplication.

use super::super::expr::{cast, func, lit_int, lit_str, CastType, Expr, ExprExt};
use super::super::token::{Token, TokenStream};
use super::DatePart;

// =============================================================================
// Quoting
// =============================================================================

/// Quote identifier with double quotes (ANSI style).
/// Used by: SQLite, Postgres, DuckDB
pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote identifier with backticks.
/// Used by: MySQL
pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Quote string with single quotes (standard SQL).
pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// =============================================================================
// Boolean Formatting
// =============================================================================

/// Used by: Postgres, DuckDB
pub fn format_bool_literal(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Used by: SQLite, MySQL
pub fn format_bool_numeric(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Emit LIMIT ... OFFSET ... (standard SQL).
pub fn emit_limit_offset_standard(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();

    if let Some(lim) = limit {
        ts.push(Token::Limit)
            .space()
            .push(Token::LitInt(lim as i64));
    }

    if let Some(off) = offset {
        if limit.is_some() {
            ts.space();
        }
        ts.push(Token::Offset)
            .space()
            .push(Token::LitInt(off as i64));
    }

    ts
}

/// SQLite only accepts OFFSET after a LIMIT; `-1` means unbounded.
pub fn emit_limit_offset_sqlite(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    match (limit, offset) {
        (None, Some(_)) => {
            let mut ts = TokenStream::new();
            ts.push(Token::Limit).space().push(Token::LitInt(-1)).space();
            ts.append(&emit_limit_offset_standard(None, offset));
            ts
        }
        _ => emit_limit_offset_standard(limit, offset),
    }
}

// =============================================================================
// Date Parts
// =============================================================================

/// `EXTRACT(...)` based date parts.
/// Used by: Postgres, DuckDB
pub fn extract_date_part(part: DatePart, expr: Expr) -> Expr {
    let field = match part {
        DatePart::Year => "YEAR",
        DatePart::Quarter => "QUARTER",
        DatePart::Month => "MONTH",
        DatePart::Week => "WEEK",
        DatePart::Day => "DAY",
        DatePart::WeekDay => "DOW",
        DatePart::Hour => "HOUR",
        DatePart::Minute => "MINUTE",
    };
    let extracted = Expr::Extract {
        field,
        expr: Box::new(expr),
    };
    if part == DatePart::WeekDay {
        extracted.add(lit_int(1))
    } else {
        extracted
    }
}

/// `STRFTIME(format, expr)` cast to an integer.
/// Used by: SQLite
pub fn strftime_int(format: &str, expr: Expr) -> Expr {
    cast(func("STRFTIME", vec![lit_str(format), expr]), CastType::Integer)
}

// =============================================================================
// Function Remapping
// =============================================================================

/// SQLite spells a few aggregates differently.
pub fn remap_function_sqlite(name: &str) -> Option<&'static str> {
    match name.to_ascii_uppercase().as_str() {
        "STRING_AGG" => Some("GROUP_CONCAT"),
        _ => None,
    }
}

/// Used by: MySQL
pub fn remap_function_mysql(name: &str) -> Option<&'static str> {
    match name.to_ascii_uppercase().as_str() {
        "STRING_AGG" => Some("GROUP_CONCAT"),
        "STRFTIME" => Some("DATE_FORMAT"),
        _ => None,
    }
}
