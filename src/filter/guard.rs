//! Security bounds checked before a filter tree is compiled.
//!
//! Violations are fatal for the whole request: the guard never drops an
//! offending clause and lets a weaker filter through.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::lookup::Lookup;
use super::tree::{FilterNode, FilterSpec};
use crate::formula::FormulaLimits;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityLimits {
    /// Maximum OR/NOT/quantifier nesting.
    pub max_depth: usize,
    /// Maximum number of leaf clauses across the whole tree.
    pub max_clauses: usize,
    pub max_regex_length: usize,
    /// Reject regexes with nested unbounded quantifiers.
    pub regex_safety_check: bool,
    /// Computed-field formula length, in characters.
    pub max_formula_length: usize,
    /// Computed-field formula nesting.
    pub max_formula_depth: usize,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_clauses: 100,
            max_regex_length: 500,
            regex_safety_check: true,
            max_formula_length: 1000,
            max_formula_depth: 64,
        }
    }
}

impl SecurityLimits {
    pub fn formula_limits(&self) -> FormulaLimits {
        FormulaLimits {
            max_length: self.max_formula_length,
            max_depth: self.max_formula_depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SecurityError {
    #[error("Filter nesting depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("Filter has more than {max} clauses")]
    TooManyClauses { max: usize },

    #[error("Regex pattern for '{field}' is {length} characters long (maximum {max})")]
    RegexTooLong {
        field: String,
        length: usize,
        max: usize,
    },

    #[error("Regex pattern for '{field}' contains nested unbounded quantifiers")]
    UnsafeRegex { field: String },

    #[error("Invalid regex pattern for '{field}': {reason}")]
    InvalidRegex { field: String, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct SecurityGuard {
    limits: SecurityLimits,
}

impl SecurityGuard {
    pub fn new(limits: SecurityLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SecurityLimits {
        &self.limits
    }

    /// Check depth, clause count and regex safety of a whole tree.
    ///
    /// AND does not add depth, so wide flat conjunctions stay cheap; OR,
    /// NOT and quantifier subtrees each add one level.
    pub fn validate(&self, node: &FilterNode) -> Result<(), SecurityError> {
        let mut clauses = 0;
        let result = self.walk(node, 0, &mut clauses);
        if let Err(e) = &result {
            warn!(error = %e, "filter rejected by security guard");
        }
        result
    }

    fn walk(&self, node: &FilterNode, depth: usize, clauses: &mut usize) -> Result<(), SecurityError> {
        if depth > self.limits.max_depth {
            return Err(SecurityError::DepthExceeded {
                depth,
                max: self.limits.max_depth,
            });
        }

        match node {
            FilterNode::And(children) => children
                .iter()
                .try_for_each(|child| self.walk(child, depth, clauses)),
            FilterNode::Or(children) => children
                .iter()
                .try_for_each(|child| self.walk(child, depth + 1, clauses)),
            FilterNode::Not(inner) => self.walk(inner, depth + 1, clauses),
            FilterNode::Leaf(spec) => {
                *clauses += 1;
                if *clauses > self.limits.max_clauses {
                    return Err(SecurityError::TooManyClauses {
                        max: self.limits.max_clauses,
                    });
                }
                if Lookup::parse(&spec.lookup).is_some_and(|l| l.is_regex()) {
                    self.check_regex(spec)?;
                }
                match &spec.nested {
                    Some(nested) => self.walk(nested, depth + 1, clauses),
                    None => Ok(()),
                }
            }
        }
    }

    fn check_regex(&self, spec: &FilterSpec) -> Result<(), SecurityError> {
        let field = spec.field.clone();
        let Value::String(pattern) = &spec.value else {
            return Err(SecurityError::InvalidRegex {
                field,
                reason: "pattern must be a string".to_string(),
            });
        };

        let length = pattern.chars().count();
        if length > self.limits.max_regex_length {
            return Err(SecurityError::RegexTooLong {
                field,
                length,
                max: self.limits.max_regex_length,
            });
        }

        if self.limits.regex_safety_check && has_nested_quantifier(pattern) {
            return Err(SecurityError::UnsafeRegex { field });
        }

        regex::RegexBuilder::new(pattern)
            .size_limit(1 << 20)
            .build()
            .map(|_| ())
            .map_err(|e| SecurityError::InvalidRegex {
                field,
                reason: e.to_string(),
            })
    }
}

/// Whether `chars[i]` starts an unbounded quantifier (`*`, `+`, `{n,}`).
fn unbounded_at(chars: &[char], i: usize) -> bool {
    match chars.get(i) {
        Some('*') | Some('+') => true,
        Some('{') => {
            let close = chars[i..].iter().position(|c| *c == '}');
            match close {
                Some(end) => {
                    let body: String = chars[i + 1..i + end].iter().collect();
                    match body.split_once(',') {
                        Some((min, "")) => min.trim().chars().all(|c| c.is_ascii_digit()),
                        _ => false,
                    }
                }
                None => false,
            }
        }
        _ => false,
    }
}

/// Detect a group that repeats without bound while containing an unbounded
/// repetition itself, e.g. `(.*)+`, `(a+)*`, `((ab)+x)*`.
///
/// Patterns run on the database's regex engine, which may backtrack.
pub fn has_nested_quantifier(pattern: &str) -> bool {
    let chars: Vec<char> = pattern.chars().collect();
    // One flag per open group: does it contain an unbounded quantifier?
    let mut groups: Vec<bool> = vec![false];
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 2;
                continue;
            }
            '[' => {
                i += 1;
                if chars.get(i) == Some(&'^') {
                    i += 1;
                }
                if chars.get(i) == Some(&']') {
                    i += 1;
                }
                while i < chars.len() && chars[i] != ']' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            '(' => groups.push(false),
            ')' if groups.len() > 1 => {
                let inner = groups.pop().unwrap_or(false);
                let repeated = unbounded_at(&chars, i + 1);
                if inner && repeated {
                    return true;
                }
                if let Some(parent) = groups.last_mut() {
                    *parent |= inner || repeated;
                }
            }
            _ if unbounded_at(&chars, i) => {
                if let Some(current) = groups.last_mut() {
                    *current = true;
                }
            }
            _ => {}
        }
        i += 1;
    }

    false
}
