//! Lookup operators and their translation to predicates.

use serde_json::Value;

use crate::sql::dialect::{DatePart, Dialect, SqlDialect};
use crate::sql::expr::{and_all, lit_bool, lit_float, lit_int, lit_null, lit_str, lower, Expr, ExprExt};

/// Comparison operators usable directly or after a date transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Exact,
    IExact,
    Ne,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    IsNull,
    Regex,
    IRegex,
    Search,
}

impl Comparison {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "exact" | "eq" => Comparison::Exact,
            "iexact" => Comparison::IExact,
            "ne" => Comparison::Ne,
            "contains" => Comparison::Contains,
            "icontains" => Comparison::IContains,
            "startswith" => Comparison::StartsWith,
            "istartswith" => Comparison::IStartsWith,
            "endswith" => Comparison::EndsWith,
            "iendswith" => Comparison::IEndsWith,
            "in" => Comparison::In,
            "not_in" => Comparison::NotIn,
            "gt" => Comparison::Gt,
            "gte" => Comparison::Gte,
            "lt" => Comparison::Lt,
            "lte" => Comparison::Lte,
            "range" => Comparison::Range,
            "isnull" => Comparison::IsNull,
            "regex" => Comparison::Regex,
            "iregex" => Comparison::IRegex,
            "search" => Comparison::Search,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Comparison::Exact => "exact",
            Comparison::IExact => "iexact",
            Comparison::Ne => "ne",
            Comparison::Contains => "contains",
            Comparison::IContains => "icontains",
            Comparison::StartsWith => "startswith",
            Comparison::IStartsWith => "istartswith",
            Comparison::EndsWith => "endswith",
            Comparison::IEndsWith => "iendswith",
            Comparison::In => "in",
            Comparison::NotIn => "not_in",
            Comparison::Gt => "gt",
            Comparison::Gte => "gte",
            Comparison::Lt => "lt",
            Comparison::Lte => "lte",
            Comparison::Range => "range",
            Comparison::IsNull => "isnull",
            Comparison::Regex => "regex",
            Comparison::IRegex => "iregex",
            Comparison::Search => "search",
        }
    }

    pub fn is_regex(self) -> bool {
        matches!(self, Comparison::Regex | Comparison::IRegex)
    }

    /// Operators that make sense on aggregate values.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Comparison::Exact
                | Comparison::Ne
                | Comparison::Gt
                | Comparison::Gte
                | Comparison::Lt
                | Comparison::Lte
                | Comparison::In
                | Comparison::NotIn
                | Comparison::Range
                | Comparison::IsNull
        )
    }
}

/// Transform applied to a date column before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTransform {
    Date,
    Part(DatePart),
}

impl DateTransform {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "date" {
            return Some(DateTransform::Date);
        }
        DatePart::parse(s).map(DateTransform::Part)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DateTransform::Date => "date",
            DateTransform::Part(part) => part.as_str(),
        }
    }

    pub fn apply(self, dialect: Dialect, expr: Expr) -> Expr {
        match self {
            DateTransform::Date => dialect.date_only(expr),
            DateTransform::Part(part) => dialect.date_part(part, expr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    Today,
    Yesterday,
    ThisWeek,
    ThisMonth,
    ThisYear,
    PastWeek,
    PastMonth,
    PastYear,
    PastDays,
}

impl Temporal {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "today" => Temporal::Today,
            "yesterday" => Temporal::Yesterday,
            "this_week" => Temporal::ThisWeek,
            "this_month" => Temporal::ThisMonth,
            "this_year" => Temporal::ThisYear,
            "past_week" => Temporal::PastWeek,
            "past_month" => Temporal::PastMonth,
            "past_year" => Temporal::PastYear,
            "past_days" => Temporal::PastDays,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Temporal::Today => "today",
            Temporal::Yesterday => "yesterday",
            Temporal::ThisWeek => "this_week",
            Temporal::ThisMonth => "this_month",
            Temporal::ThisYear => "this_year",
            Temporal::PastWeek => "past_week",
            Temporal::PastMonth => "past_month",
            Temporal::PastYear => "past_year",
            Temporal::PastDays => "past_days",
        }
    }
}

/// Quantifiers over a to-many relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Some,
    Every,
    None,
}

impl Quantifier {
    pub fn as_str(self) -> &'static str {
        match self {
            Quantifier::Some => "some",
            Quantifier::Every => "every",
            Quantifier::None => "none",
        }
    }
}

/// A parsed lookup string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Compare {
        transform: Option<DateTransform>,
        op: Comparison,
    },
    Temporal(Temporal),
    Quantifier(Quantifier),
    /// Related-row count compared with `op` (`count`, `count__gte`).
    Count(Comparison),
    Window,
    Was,
    InSubquery,
}

impl Lookup {
    /// Parse `gte`, `year`, `year__gte`, `this_month`, `some`, `count__lt`, ...
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if let Some((head, tail)) = s.split_once("__") {
            let op = Comparison::parse(tail)?;
            if head == "count" {
                return Some(Lookup::Count(op));
            }
            let transform = DateTransform::parse(head)?;
            return Some(Lookup::Compare {
                transform: Some(transform),
                op,
            });
        }

        if let Some(op) = Comparison::parse(&s) {
            return Some(Lookup::Compare {
                transform: None,
                op,
            });
        }
        if let Some(transform) = DateTransform::parse(&s) {
            return Some(Lookup::Compare {
                transform: Some(transform),
                op: Comparison::Exact,
            });
        }
        if let Some(temporal) = Temporal::parse(&s) {
            return Some(Lookup::Temporal(temporal));
        }
        Some(match s.as_str() {
            "some" => Lookup::Quantifier(Quantifier::Some),
            "every" => Lookup::Quantifier(Quantifier::Every),
            "none" => Lookup::Quantifier(Quantifier::None),
            "count" => Lookup::Count(Comparison::Exact),
            "window" => Lookup::Window,
            "was" => Lookup::Was,
            "in_subquery" => Lookup::InSubquery,
            _ => return None,
        })
    }

    /// Names checked against a dataset's `allowed_lookups`.
    pub fn policy_names(&self) -> Vec<&'static str> {
        match self {
            Lookup::Compare {
                transform: Some(t),
                op,
            } => vec![t.as_str(), op.as_str()],
            Lookup::Compare {
                transform: None,
                op,
            } => vec![op.as_str()],
            Lookup::Temporal(t) => vec![t.as_str()],
            Lookup::Quantifier(q) => vec![q.as_str()],
            Lookup::Count(_) => vec!["count"],
            Lookup::Window => vec!["window"],
            Lookup::Was => vec!["was"],
            Lookup::InSubquery => vec!["in_subquery"],
        }
    }

    /// Lookups whose field names a to-many relation rather than a column.
    pub fn targets_relation(&self) -> bool {
        matches!(self, Lookup::Quantifier(_) | Lookup::Count(_))
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Lookup::Compare { op, .. } if op.is_regex())
    }
}

/// Convert a JSON scalar into a SQL literal.
pub fn literal(value: &Value) -> Result<Expr, String> {
    match value {
        Value::Null => Ok(lit_null()),
        Value::Bool(b) => Ok(lit_bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(lit_int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(lit_float(f))
            } else {
                Err(format!("unsupported number {}", n))
            }
        }
        Value::String(s) => Ok(lit_str(s)),
        Value::Array(_) | Value::Object(_) => Err("expected a scalar value".to_string()),
    }
}

fn text(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err("expected a string value".to_string()),
    }
}

/// Escape `%`, `_` and the escape character for a LIKE pattern.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn like(expr: Expr, pattern: String, case_insensitive: bool) -> Expr {
    if case_insensitive {
        lower(expr).like_escape(lit_str(&pattern.to_lowercase()), '\\')
    } else {
        expr.like_escape(lit_str(&pattern), '\\')
    }
}

fn list(value: &Value) -> Result<Vec<Expr>, String> {
    match value {
        Value::Array(items) => items.iter().map(literal).collect(),
        scalar => Ok(vec![literal(scalar)?]),
    }
}

fn non_null(value: &Value) -> Result<Expr, String> {
    if value.is_null() {
        return Err("null cannot be compared; use isnull".to_string());
    }
    literal(value)
}

/// Build the predicate for `expr <op> value`.
pub fn apply(dialect: Dialect, expr: Expr, op: Comparison, value: &Value) -> Result<Expr, String> {
    Ok(match op {
        Comparison::Exact if value.is_null() => expr.is_null(),
        Comparison::Exact => expr.eq(literal(value)?),
        Comparison::IExact => match value {
            Value::String(s) => lower(expr).eq(lit_str(&s.to_lowercase())),
            other => expr.eq(non_null(other)?),
        },
        Comparison::Ne if value.is_null() => expr.is_not_null(),
        Comparison::Ne => expr.ne(literal(value)?),
        Comparison::Contains => like(expr, format!("%{}%", escape_like(&text(value)?)), false),
        Comparison::IContains => like(expr, format!("%{}%", escape_like(&text(value)?)), true),
        Comparison::StartsWith => like(expr, format!("{}%", escape_like(&text(value)?)), false),
        Comparison::IStartsWith => like(expr, format!("{}%", escape_like(&text(value)?)), true),
        Comparison::EndsWith => like(expr, format!("%{}", escape_like(&text(value)?)), false),
        Comparison::IEndsWith => like(expr, format!("%{}", escape_like(&text(value)?)), true),
        Comparison::In => expr.in_list(list(value)?),
        Comparison::NotIn => expr.not_in_list(list(value)?),
        Comparison::Gt => expr.gt(non_null(value)?),
        Comparison::Gte => expr.gte(non_null(value)?),
        Comparison::Lt => expr.lt(non_null(value)?),
        Comparison::Lte => expr.lte(non_null(value)?),
        Comparison::Range => match value.as_array().map(Vec::as_slice) {
            Some([low, high]) => expr.between(non_null(low)?, non_null(high)?),
            _ => return Err("range expects [low, high]".to_string()),
        },
        Comparison::IsNull => match value {
            Value::Bool(true) => expr.is_null(),
            Value::Bool(false) => expr.is_not_null(),
            _ => return Err("isnull expects true or false".to_string()),
        },
        Comparison::Regex | Comparison::IRegex => match value {
            Value::String(pattern) => {
                dialect.regex_match(expr, pattern, op == Comparison::IRegex)
            }
            _ => return Err("regex expects a string pattern".to_string()),
        },
        Comparison::Search => {
            let query = text(value)?;
            and_all(
                query
                    .split_whitespace()
                    .map(|term| like(expr.clone(), format!("%{}%", escape_like(term)), true)),
            )
            .ok_or_else(|| "search expects at least one term".to_string())?
        }
    })
}
