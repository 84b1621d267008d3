//! Reshape aggregate rows into an index × column matrix.

use serde_json::Value;

use crate::model::{PivotTable, Row};

/// `{index, columns, values}`: three output aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotSpec {
    pub index: String,
    pub columns: String,
    pub values: String,
}

impl PivotSpec {
    /// Accept only an object whose three keys are all strings.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    format!(
                        "Pivot ignored: '{}' must be a string naming an output column",
                        name
                    )
                })
        };
        Ok(Self {
            index: field("index")?,
            columns: field("columns")?,
            values: field("values")?,
        })
    }
}

/// Text used in a pivoted column name for a column value.
fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn push_distinct(values: &mut Vec<Value>, value: &Value) -> usize {
    match values.iter().position(|v| v == value) {
        Some(i) => i,
        None => {
            values.push(value.clone());
            values.len() - 1
        }
    }
}

/// One output row per distinct index value, one `<column value>__<values>`
/// key per distinct column value. Both axes keep first-seen order; missing
/// cells are null.
pub fn pivot(rows: &[Row], spec: &PivotSpec) -> PivotTable {
    let mut index_values: Vec<Value> = Vec::new();
    let mut column_values: Vec<Value> = Vec::new();
    let mut cells: Vec<(usize, usize, Value)> = Vec::new();

    for row in rows {
        let index = row.get(&spec.index).unwrap_or(&Value::Null);
        let column = row.get(&spec.columns).unwrap_or(&Value::Null);
        let value = row.get(&spec.values).cloned().unwrap_or(Value::Null);
        let i = push_distinct(&mut index_values, index);
        let c = push_distinct(&mut column_values, column);
        cells.push((i, c, value));
    }

    let keys: Vec<String> = column_values
        .iter()
        .map(|c| format!("{}__{}", label(c), spec.values))
        .collect();

    let mut out: Vec<Row> = index_values
        .iter()
        .map(|index| {
            let mut row = Row::new();
            row.insert(spec.index.clone(), index.clone());
            for key in &keys {
                row.insert(key.clone(), Value::Null);
            }
            row
        })
        .collect();

    for (i, c, value) in cells {
        out[i].insert(keys[c].clone(), value);
    }

    PivotTable {
        index: spec.index.clone(),
        columns: spec.columns.clone(),
        values: spec.values.clone(),
        index_values,
        column_values,
        rows: out,
    }
}
