//! Resolve requested dimensions, metrics and computed fields.
//!
//! A request names declared items by alias, or (when the dataset sets
//! `allow_ad_hoc`) defines them inline as objects. Anything unusable is
//! dropped with a warning. When a non-empty request leaves nothing usable,
//! the declared list is used instead; an empty list selects nothing.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::aggregation::AggregationTable;
use super::sanitize::sanitize_identifier;
use crate::error::{QueryError, QueryResult};
use crate::model::{ComputedField, DatasetDefinition, Dimension, Metric};

/// A resolved item with its output alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Named<T> {
    pub name: String,
    pub def: T,
    /// Defined inline by the request rather than declared on the dataset.
    pub ad_hoc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    pub items: Vec<Named<T>>,
    pub warnings: Vec<String>,
}

/// Default alias: the sanitized field, or `<field>_<transform>`.
pub fn dimension_alias(dimension: &Dimension) -> String {
    match (&dimension.name, &dimension.transform) {
        (Some(name), _) => sanitize_identifier(name, "dimension"),
        (None, None) => sanitize_identifier(&dimension.field, "dimension"),
        (None, Some(transform)) => sanitize_identifier(
            &format!("{}_{}", dimension.field, transform.alias_suffix()),
            "dimension",
        ),
    }
}

/// Default alias: `<field>_<aggregation>`, or `count` for a row count.
pub fn metric_alias(metric: &Metric) -> String {
    if let Some(name) = &metric.name {
        return sanitize_identifier(name, "metric");
    }
    let aggregation = AggregationTable::canonical(&metric.aggregation);
    match metric_field(metric) {
        Some(field) => sanitize_identifier(&format!("{}_{}", field, aggregation), "metric"),
        None => sanitize_identifier(&aggregation, "metric"),
    }
}

/// The metric's field, treating `*` and the empty string as "every row".
pub fn metric_field(metric: &Metric) -> Option<&str> {
    metric
        .field
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty() && *f != "*")
}

pub struct Resolver<'a> {
    dataset: &'a DatasetDefinition,
    aggregations: &'a AggregationTable,
}

impl<'a> Resolver<'a> {
    pub fn new(dataset: &'a DatasetDefinition, aggregations: &'a AggregationTable) -> Self {
        Self {
            dataset,
            aggregations,
        }
    }

    fn ad_hoc_field_allowed(&self, field: &str) -> bool {
        match &self.dataset.metadata.allowed_fields {
            Some(allowed) => allowed.iter().any(|f| f == field),
            None => true,
        }
    }

    pub fn resolve_dimensions(&self, requested: Option<&[Value]>) -> Resolution<Dimension> {
        let declared: Vec<Named<Dimension>> = self
            .dataset
            .dimensions
            .iter()
            .map(|d| Named {
                name: dimension_alias(d),
                def: d.clone(),
                ad_hoc: false,
            })
            .collect();

        resolve_list("dimension", declared, requested, self.dataset.metadata.allow_ad_hoc, |def: Dimension| {
            if !self.ad_hoc_field_allowed(&def.field) {
                return Err(format!("Field '{}' is not allowed for ad-hoc dimensions", def.field));
            }
            Ok(Named {
                name: dimension_alias(&def),
                def,
                ad_hoc: true,
            })
        })
    }

    /// Declared metrics with an aggregation the dialect cannot build are a
    /// hard error; ad-hoc ones are dropped with a warning.
    pub fn resolve_metrics(&self, requested: Option<&[Value]>) -> QueryResult<Resolution<Metric>> {
        let declared: Vec<Named<Metric>> = self
            .dataset
            .metrics
            .iter()
            .map(|m| Named {
                name: metric_alias(m),
                def: m.clone(),
                ad_hoc: false,
            })
            .collect();

        let resolution = resolve_list("metric", declared, requested, self.dataset.metadata.allow_ad_hoc, |def: Metric| {
            if let Some(field) = metric_field(&def) {
                if !self.ad_hoc_field_allowed(field) {
                    return Err(format!("Field '{}' is not allowed for ad-hoc metrics", field));
                }
            }
            if !self.aggregations.supports(&def.aggregation) {
                return Err(format!(
                    "Aggregation '{}' is not supported by {}",
                    def.aggregation,
                    self.aggregations.dialect()
                ));
            }
            Ok(Named {
                name: metric_alias(&def),
                def,
                ad_hoc: true,
            })
        });

        if let Some(bad) = resolution
            .items
            .iter()
            .find(|m| !self.aggregations.supports(&m.def.aggregation))
        {
            return Err(QueryError::UnsupportedAggregation {
                name: bad.def.aggregation.clone(),
                dialect: self.aggregations.dialect().to_string(),
            });
        }
        Ok(resolution)
    }

    pub fn resolve_computed_fields(&self, requested: Option<&[Value]>) -> Resolution<ComputedField> {
        let declared: Vec<Named<ComputedField>> = self
            .dataset
            .computed_fields
            .iter()
            .map(|c| Named {
                name: sanitize_identifier(&c.name, "computed"),
                def: c.clone(),
                ad_hoc: false,
            })
            .collect();

        resolve_list("computed field", declared, requested, self.dataset.metadata.allow_ad_hoc, |def: ComputedField| {
            Ok(Named {
                name: sanitize_identifier(&def.name, "computed"),
                def,
                ad_hoc: true,
            })
        })
    }
}

fn resolve_list<T, F>(
    kind: &str,
    declared: Vec<Named<T>>,
    requested: Option<&[Value]>,
    allow_ad_hoc: bool,
    mut ad_hoc: F,
) -> Resolution<T>
where
    T: Clone + DeserializeOwned,
    F: FnMut(T) -> Result<Named<T>, String>,
{
    let Some(requested) = requested else {
        return Resolution {
            items: declared,
            warnings: Vec::new(),
        };
    };

    let mut items: Vec<Named<T>> = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = BTreeSet::new();

    for entry in requested {
        let item = match entry {
            Value::String(name) => match declared.iter().find(|d| d.name == *name) {
                Some(found) => found.clone(),
                None => {
                    warnings.push(format!("Unknown {} '{}'", kind, name));
                    continue;
                }
            },
            Value::Object(_) if !allow_ad_hoc => {
                warnings.push(format!("Ad-hoc {} definitions are not allowed for this dataset", kind));
                continue;
            }
            Value::Object(_) => {
                let parsed = serde_json::from_value::<T>(entry.clone())
                    .map_err(|e| format!("Invalid {} definition: {}", kind, e))
                    .and_then(&mut ad_hoc);
                match parsed {
                    Ok(item) => item,
                    Err(message) => {
                        warnings.push(message);
                        continue;
                    }
                }
            }
            other => {
                warnings.push(format!("Ignoring malformed {} entry: {}", kind, other));
                continue;
            }
        };

        if !seen.insert(item.name.clone()) {
            warnings.push(format!("Duplicate {} '{}' ignored", kind, item.name));
            continue;
        }
        items.push(item);
    }

    if items.is_empty() && !requested.is_empty() {
        warnings.push(format!("No usable {} requested; using the declared list", kind));
        items = declared;
    }

    Resolution { items, warnings }
}
