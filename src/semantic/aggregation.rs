//! Aggregation vocabulary.
//!
//! An [`AggregationTable`] maps aggregation names to builder functions. The
//! core set is always present; backend extensions (`string_agg`,
//! `array_agg`, `percentile`, `stddev`, `variance`) are registered only when
//! the dialect can render them.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::sql::dialect::{Dialect, SqlDialect};
use crate::sql::expr::{avg, col, count, count_distinct, count_star, max, min, sum, Expr};

/// Per-metric options (`separator`, `percentile`, `distinct`).
pub type AggregateOptions = BTreeMap<String, Value>;

/// Build an aggregate over `arg`; `None` means "every row" and is only
/// meaningful for `count`.
pub type AggregateBuilder = fn(Dialect, Option<Expr>, &AggregateOptions) -> Result<Expr, String>;

#[derive(Clone)]
pub struct AggregationTable {
    dialect: Dialect,
    builders: BTreeMap<&'static str, AggregateBuilder>,
}

impl fmt::Debug for AggregationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationTable")
            .field("dialect", &self.dialect)
            .field("names", &self.names())
            .finish()
    }
}

fn required(arg: Option<Expr>, name: &str) -> Result<Expr, String> {
    arg.ok_or_else(|| format!("{} requires a field", name))
}

fn distinct_option(options: &AggregateOptions) -> bool {
    options.get("distinct").and_then(Value::as_bool).unwrap_or(false)
}

fn build_count(_: Dialect, arg: Option<Expr>, options: &AggregateOptions) -> Result<Expr, String> {
    Ok(match arg {
        None => count_star(),
        Some(arg) if distinct_option(options) => count_distinct(arg),
        Some(arg) => count(arg),
    })
}

fn build_distinct_count(_: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    Ok(count_distinct(required(arg, "distinct_count")?))
}

fn build_sum(_: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    Ok(sum(required(arg, "sum")?))
}

fn build_avg(_: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    Ok(avg(required(arg, "avg")?))
}

fn build_min(_: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    Ok(min(required(arg, "min")?))
}

fn build_max(_: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    Ok(max(required(arg, "max")?))
}

fn build_string_agg(dialect: Dialect, arg: Option<Expr>, options: &AggregateOptions) -> Result<Expr, String> {
    let separator = match options.get("separator") {
        None => ",",
        Some(Value::String(s)) => s.as_str(),
        Some(other) => return Err(format!("separator must be a string, got {}", other)),
    };
    dialect
        .string_agg(required(arg, "string_agg")?, separator)
        .ok_or_else(|| format!("{} does not support separator '{}'", dialect, separator))
}

fn build_array_agg(dialect: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    dialect
        .array_agg(required(arg, "array_agg")?)
        .ok_or_else(|| format!("{} does not support array_agg", dialect))
}

fn build_percentile(dialect: Dialect, arg: Option<Expr>, options: &AggregateOptions) -> Result<Expr, String> {
    let fraction = match options.get("percentile") {
        None => 0.5,
        Some(v) => v
            .as_f64()
            .filter(|f| (0.0..=1.0).contains(f))
            .ok_or_else(|| format!("percentile must be a number between 0 and 1, got {}", v))?,
    };
    dialect
        .percentile(required(arg, "percentile")?, fraction)
        .ok_or_else(|| format!("{} does not support percentile", dialect))
}

fn build_stddev(dialect: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    dialect
        .stddev(required(arg, "stddev")?)
        .ok_or_else(|| format!("{} does not support stddev", dialect))
}

fn build_variance(dialect: Dialect, arg: Option<Expr>, _: &AggregateOptions) -> Result<Expr, String> {
    dialect
        .variance(required(arg, "variance")?)
        .ok_or_else(|| format!("{} does not support variance", dialect))
}

impl AggregationTable {
    pub fn for_dialect(dialect: Dialect) -> Self {
        let mut builders: BTreeMap<&'static str, AggregateBuilder> = BTreeMap::new();
        builders.insert("count", build_count);
        builders.insert("distinct_count", build_distinct_count);
        builders.insert("sum", build_sum);
        builders.insert("avg", build_avg);
        builders.insert("min", build_min);
        builders.insert("max", build_max);

        let sample = col("x");
        if dialect.string_agg(sample.clone(), ",").is_some() {
            builders.insert("string_agg", build_string_agg);
        }
        if dialect.array_agg(sample.clone()).is_some() {
            builders.insert("array_agg", build_array_agg);
        }
        if dialect.percentile(sample.clone(), 0.5).is_some() {
            builders.insert("percentile", build_percentile);
        }
        if dialect.stddev(sample.clone()).is_some() {
            builders.insert("stddev", build_stddev);
        }
        if dialect.variance(sample).is_some() {
            builders.insert("variance", build_variance);
        }

        Self { dialect, builders }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Accepts the canonical name and the common spellings `count_distinct`
    /// and `average`.
    pub fn canonical(name: &str) -> String {
        match name.trim().to_ascii_lowercase().as_str() {
            "count_distinct" | "countdistinct" => "distinct_count".to_string(),
            "average" | "mean" => "avg".to_string(),
            other => other.to_string(),
        }
    }

    pub fn supports(&self, name: &str) -> bool {
        self.builders.contains_key(Self::canonical(name).as_str())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.builders.keys().copied().collect()
    }

    /// Build the aggregate. Unknown names and invalid options are errors.
    pub fn build(&self, name: &str, arg: Option<Expr>, options: &AggregateOptions) -> Result<Expr, String> {
        let canonical = Self::canonical(name);
        let builder = self
            .builders
            .get(canonical.as_str())
            .ok_or_else(|| format!("aggregation '{}' is not supported by {}", name, self.dialect))?;
        builder(self.dialect, arg, options)
    }
}
