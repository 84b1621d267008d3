//! Dataset definitions: the persisted configuration an engine runs against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::sql::dialect::{DateGrain, DatePart};

/// Policy knobs stored in a dataset's metadata bag.
///
/// Unknown keys are kept in `extra` so a definition round-trips unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetPolicy {
    pub allow_ad_hoc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_lookups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub quick_search_fields: Vec<String>,
    /// Flat field allowlist for records mode.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub record_fields: Vec<String>,
    /// Entities (and their fields) usable by `in_subquery` filters.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub allowed_subqueries: BTreeMap<String, Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A transform applied to a dimension's field before grouping.
///
/// Written as `lower`, `upper`, `trunc:<grain>` or `extract:<part>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DimensionTransform {
    Lower,
    Upper,
    Trunc(DateGrain),
    Extract(DatePart),
}

impl DimensionTransform {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None => match s.as_str() {
                "lower" | "lowercase" => Some(DimensionTransform::Lower),
                "upper" | "uppercase" => Some(DimensionTransform::Upper),
                _ => None,
            },
            Some(("trunc", grain)) => DateGrain::parse(grain).map(DimensionTransform::Trunc),
            Some(("extract", part)) => DatePart::parse(part).map(DimensionTransform::Extract),
            Some(_) => None,
        }
    }

    /// Suffix used when deriving a default alias (`created_month`).
    pub fn alias_suffix(&self) -> &'static str {
        match self {
            DimensionTransform::Lower => "lower",
            DimensionTransform::Upper => "upper",
            DimensionTransform::Trunc(grain) => grain.as_str(),
            DimensionTransform::Extract(part) => part.as_str(),
        }
    }
}

impl fmt::Display for DimensionTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionTransform::Lower => write!(f, "lower"),
            DimensionTransform::Upper => write!(f, "upper"),
            DimensionTransform::Trunc(grain) => write!(f, "trunc:{}", grain.as_str()),
            DimensionTransform::Extract(part) => write!(f, "extract:{}", part.as_str()),
        }
    }
}

impl TryFrom<String> for DimensionTransform {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DimensionTransform::parse(&value).ok_or_else(|| format!("unknown transform '{}'", value))
    }
}

impl From<DimensionTransform> for String {
    fn from(t: DimensionTransform) -> Self {
        t.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<DimensionTransform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `None` only for `count`, which then counts rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub aggregation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Filter tree scoping the aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    /// Aggregation options: `separator`, `percentile`, `distinct`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputedStage {
    Query,
    #[default]
    Post,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedField {
    pub name: String,
    pub formula: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default)]
    pub stage: ComputedStage,
}

fn default_preview_limit() -> u64 {
    100
}

/// A named dataset over one source entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub code: String,
    #[serde(default)]
    pub title: String,
    /// Source entity name in the catalog.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_filters: Option<Value>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub computed_fields: Vec<ComputedField>,
    #[serde(default)]
    pub ordering: Vec<String>,
    #[serde(default = "default_preview_limit")]
    pub preview_limit: u64,
    #[serde(default)]
    pub metadata: DatasetPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DatasetDefinition {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Version token used in cache keys; changes whenever the definition is saved.
    pub fn version(&self) -> String {
        self.updated_at
            .map(|ts| ts.timestamp_millis().to_string())
            .unwrap_or_else(|| "0".to_string())
    }

    /// Every field path referenced by declared dimensions and metrics.
    pub fn declared_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .dimensions
            .iter()
            .map(|d| d.field.clone())
            .chain(self.metrics.iter().filter_map(|m| m.field.clone()))
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}
