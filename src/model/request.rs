//! Request and response payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::filter::FilterSpec;

/// A materialized result row.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Records,
    Aggregate,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Records => "records",
            ExecutionMode::Aggregate => "aggregate",
        }
    }
}

/// Client request against a dataset.
///
/// Dimension, metric and computed-field entries are either names of
/// declared items or ad-hoc definitions, so they stay as raw JSON until the
/// resolver looks at them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryRequest {
    pub mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_fields: Option<Vec<Value>>,
    #[serde(alias = "where", skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pivot: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
}

impl QueryRequest {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn records() -> Self {
        Self::default()
    }

    pub fn aggregate() -> Self {
        Self {
            mode: ExecutionMode::Aggregate,
            ..Self::default()
        }
    }

    pub fn use_cache(&self) -> bool {
        self.cache.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

/// Reshaped aggregate rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotTable {
    pub index: String,
    pub columns: String,
    pub values: String,
    pub index_values: Vec<Value>,
    pub column_values: Vec<Value>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub mode: ExecutionMode,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub applied_filters: Vec<FilterSpec>,
    pub ordering: Vec<String>,
    pub limit: u64,
    pub offset: u64,
    pub warnings: Vec<String>,
    pub cache: CacheInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pivot: Option<PivotTable>,
}
