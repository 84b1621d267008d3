//! Filter trees: the normalized, recursive form of client filter input.
//!
//! Accepted JSON shapes:
//!
//! ```text
//! {"status": "paid"}                            leaf, `exact`
//! {"amount__gte": 10}                           lookup in the key
//! {"amount": {"gte": 10, "lt": 100}}            leaf map, one clause per lookup
//! {"AND": [...]} / {"OR": [...]} / {"NOT": ...}  branches
//! {"items": [...], "op": "or", "negate": true}   normalized branch
//! {"field": "amount", "lookup": "gt", "value": 5, "connector": "or"}
//! [spec, spec, ...]                              folded by each spec's connector
//! ```
//!
//! A key ends in a lookup when its trailing `__` segments name one and the
//! value is not an object (relation lookups such as `lines__some` take
//! objects too). A column whose name is also a lookup (`date`, `year`) is
//! filtered through the leaf-map form.
//!
//! Malformed pieces are dropped with a warning.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::lookup::{Lookup, Quantifier};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connector {
    #[default]
    And,
    Or,
}

fn default_lookup() -> String {
    "exact".to_string()
}

/// One field/lookup/value clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field: String,
    #[serde(default = "default_lookup")]
    pub lookup: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub connector: Connector,
    #[serde(default)]
    pub negate: bool,
    /// Parsed subtree for quantifier and `in_subquery` lookups.
    #[serde(skip)]
    pub nested: Option<Box<FilterNode>>,
}

impl FilterSpec {
    pub fn new(field: &str, lookup: &str, value: Value) -> Self {
        Self {
            field: field.to_string(),
            lookup: lookup.to_string(),
            value,
            connector: Connector::And,
            negate: false,
            nested: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Leaf(FilterSpec),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
}

impl Default for FilterNode {
    fn default() -> Self {
        FilterNode::And(Vec::new())
    }
}

impl FilterNode {
    pub fn leaf(field: &str, lookup: &str, value: Value) -> Self {
        FilterNode::Leaf(FilterSpec::new(field, lookup, value))
    }

    /// Parse client JSON, appending a warning for every dropped piece.
    pub fn parse(value: &Value, warnings: &mut Vec<String>) -> FilterNode {
        match value {
            Value::Null => FilterNode::default(),
            Value::Array(items) => parse_list(items, warnings),
            Value::Object(map) => parse_object(map, warnings),
            other => {
                warnings.push(format!("Ignoring malformed filter node: {}", other));
                FilterNode::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FilterNode::Leaf(_) => false,
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().all(FilterNode::is_empty)
            }
            FilterNode::Not(inner) => inner.is_empty(),
        }
    }

    /// Number of leaf clauses, including those inside quantifier subtrees.
    pub fn clause_count(&self) -> usize {
        match self {
            FilterNode::Leaf(spec) => {
                1 + spec.nested.as_deref().map_or(0, FilterNode::clause_count)
            }
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().map(FilterNode::clause_count).sum()
            }
            FilterNode::Not(inner) => inner.clause_count(),
        }
    }

    fn and_with(self, other: FilterNode) -> FilterNode {
        match self {
            FilterNode::And(mut children) => {
                children.push(other);
                FilterNode::And(children)
            }
            node => FilterNode::And(vec![node, other]),
        }
    }

    fn or_with(self, other: FilterNode) -> FilterNode {
        match self {
            FilterNode::Or(mut children) => {
                children.push(other);
                FilterNode::Or(children)
            }
            node => FilterNode::Or(vec![node, other]),
        }
    }
}

fn parse_list(items: &[Value], warnings: &mut Vec<String>) -> FilterNode {
    let mut result: Option<FilterNode> = None;
    for item in items {
        let connector = item
            .get("connector")
            .and_then(Value::as_str)
            .map(|c| c.eq_ignore_ascii_case("or"))
            .unwrap_or(false);
        let node = FilterNode::parse(item, warnings);
        result = Some(match result {
            None => node,
            Some(acc) if connector => acc.or_with(node),
            Some(acc) => acc.and_with(node),
        });
    }
    result.unwrap_or_default()
}

fn parse_children(value: &Value, warnings: &mut Vec<String>) -> Vec<FilterNode> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| FilterNode::parse(item, warnings))
            .collect(),
        other => vec![FilterNode::parse(other, warnings)],
    }
}

const SPEC_KEYS: [&str; 5] = ["field", "lookup", "value", "connector", "negate"];

fn parse_object(map: &Map<String, Value>, warnings: &mut Vec<String>) -> FilterNode {
    if let Some(items) = map.get("items") {
        let children = parse_children(items, warnings);
        let is_or = map
            .get("op")
            .and_then(Value::as_str)
            .is_some_and(|op| op.eq_ignore_ascii_case("or"));
        let node = if is_or {
            FilterNode::Or(children)
        } else {
            FilterNode::And(children)
        };
        let negate = map.get("negate").and_then(Value::as_bool).unwrap_or(false);
        return if negate {
            FilterNode::Not(Box::new(node))
        } else {
            node
        };
    }

    if map.get("field").is_some_and(Value::is_string)
        && map.keys().all(|k| SPEC_KEYS.contains(&k.as_str()))
    {
        return match serde_json::from_value::<FilterSpec>(Value::Object(map.clone())) {
            Ok(spec) => FilterNode::Leaf(with_nested(spec, warnings)),
            Err(e) => {
                warnings.push(format!("Ignoring malformed filter spec: {}", e));
                FilterNode::default()
            }
        };
    }

    let mut parts = Vec::new();
    for (key, value) in map {
        match key.as_str() {
            "AND" => parts.push(FilterNode::And(parse_children(value, warnings))),
            "OR" => parts.push(FilterNode::Or(parse_children(value, warnings))),
            "NOT" => parts.push(FilterNode::Not(Box::new(FilterNode::parse(value, warnings)))),
            field => parts.extend(parse_field(field, value, warnings)),
        }
    }

    if parts.len() == 1 {
        parts.pop().unwrap_or_default()
    } else {
        FilterNode::And(parts)
    }
}

/// `amount__gte` -> (`amount`, `gte`); the longest lookup suffix wins.
fn split_lookup_key<'k>(key: &'k str, value: &Value) -> Option<(&'k str, &'k str)> {
    key.match_indices("__").find_map(|(at, _)| {
        let (field, lookup) = (&key[..at], &key[at + 2..]);
        let parsed = Lookup::parse(lookup)?;
        let takes_object = parsed.targets_relation() || parsed == Lookup::InSubquery;
        (!field.is_empty() && (takes_object || !value.is_object())).then_some((field, lookup))
    })
}

fn parse_field(key: &str, value: &Value, warnings: &mut Vec<String>) -> Vec<FilterNode> {
    if let Some((field, lookup)) = split_lookup_key(key, value) {
        let spec = FilterSpec::new(field, lookup, value.clone());
        return vec![FilterNode::Leaf(with_nested(spec, warnings))];
    }
    let field = key;
    let clause = |lookup: &str, value: &Value, warnings: &mut Vec<String>| {
        FilterNode::Leaf(with_nested(
            FilterSpec::new(field, lookup, value.clone()),
            warnings,
        ))
    };

    match value {
        Value::Object(lookups) if lookups.is_empty() => {
            warnings.push(format!("Ignoring empty filter for '{}'", field));
            Vec::new()
        }
        Value::Object(lookups) => lookups
            .iter()
            .map(|(lookup, v)| clause(lookup, v, warnings))
            .collect(),
        Value::Array(_) => vec![clause("in", value, warnings)],
        _ => vec![clause("exact", value, warnings)],
    }
}

/// Parse the subtree carried by quantifier and subquery lookups.
fn with_nested(mut spec: FilterSpec, warnings: &mut Vec<String>) -> FilterSpec {
    let subtree = match Lookup::parse(&spec.lookup) {
        Some(Lookup::Quantifier(
            Quantifier::Some | Quantifier::Every | Quantifier::None,
        )) => Some(&spec.value),
        Some(Lookup::Count(_)) | Some(Lookup::InSubquery) => spec.value.get("filter"),
        _ => None,
    };
    if let Some(subtree) = subtree {
        let node = FilterNode::parse(subtree, warnings);
        spec.nested = Some(Box::new(node));
    }
    spec
}
