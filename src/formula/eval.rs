//! Row-stage formula evaluation.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::ast::{BinaryOp, CompareOp, FormulaExpr, Logical, Stage, UnaryOp};
use super::{parse, FormulaError, FormulaResult};

/// A value produced while evaluating a row formula.
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl FormulaValue {
    fn type_name(&self) -> &'static str {
        match self {
            FormulaValue::Int(_) => "int",
            FormulaValue::Float(_) => "float",
            FormulaValue::Bool(_) => "bool",
            FormulaValue::Str(_) => "str",
            FormulaValue::Null => "None",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            FormulaValue::Int(n) => *n != 0,
            FormulaValue::Float(f) => *f != 0.0,
            FormulaValue::Bool(b) => *b,
            FormulaValue::Str(s) => !s.is_empty(),
            FormulaValue::Null => false,
        }
    }

    /// Row values: numbers, booleans, strings and null. Arrays and objects
    /// are not addressable from formulas.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(FormulaValue::Null),
            Value::Bool(b) => Some(FormulaValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(FormulaValue::Int)
                .or_else(|| n.as_f64().map(FormulaValue::Float)),
            Value::String(s) => Some(FormulaValue::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            FormulaValue::Int(n) => Value::from(n),
            FormulaValue::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FormulaValue::Bool(b) => Value::Bool(b),
            FormulaValue::Str(s) => Value::String(s),
            FormulaValue::Null => Value::Null,
        }
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

fn number(value: &FormulaValue) -> Option<Number> {
    match value {
        FormulaValue::Int(n) => Some(Number::Int(*n)),
        FormulaValue::Bool(b) => Some(Number::Int(i64::from(*b))),
        FormulaValue::Float(f) => Some(Number::Float(*f)),
        _ => None,
    }
}

fn as_float(n: &Number) -> f64 {
    match n {
        Number::Int(i) => *i as f64,
        Number::Float(f) => *f,
    }
}

fn finite(f: f64) -> FormulaResult<FormulaValue> {
    if f.is_finite() {
        Ok(FormulaValue::Float(f))
    } else if f.is_nan() {
        Err(FormulaError::Domain)
    } else {
        Err(FormulaError::Overflow)
    }
}

fn floor_mod_int(a: i64, b: i64) -> FormulaResult<i64> {
    if b == 0 {
        return Err(FormulaError::DivisionByZero);
    }
    let r = a.checked_rem(b).ok_or(FormulaError::Overflow)?;
    Ok(if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
}

fn floor_mod_float(a: f64, b: f64) -> FormulaResult<FormulaValue> {
    if b == 0.0 {
        return Err(FormulaError::DivisionByZero);
    }
    let r = a % b;
    finite(if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r })
}

fn arithmetic(op: BinaryOp, left: FormulaValue, right: FormulaValue) -> FormulaResult<FormulaValue> {
    if let (BinaryOp::Add, FormulaValue::Str(a), FormulaValue::Str(b)) = (op, &left, &right) {
        return Ok(FormulaValue::Str(format!("{}{}", a, b)));
    }

    let (Some(a), Some(b)) = (number(&left), number(&right)) else {
        return Err(FormulaError::Type {
            op: op.symbol(),
            left: left.type_name(),
            right: right.type_name(),
        });
    };

    match (op, a, b) {
        (BinaryOp::Div, a, b) => {
            let divisor = as_float(&b);
            if divisor == 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            finite(as_float(&a) / divisor)
        }
        (BinaryOp::Add, Number::Int(a), Number::Int(b)) => {
            a.checked_add(b).map(FormulaValue::Int).ok_or(FormulaError::Overflow)
        }
        (BinaryOp::Sub, Number::Int(a), Number::Int(b)) => {
            a.checked_sub(b).map(FormulaValue::Int).ok_or(FormulaError::Overflow)
        }
        (BinaryOp::Mul, Number::Int(a), Number::Int(b)) => {
            a.checked_mul(b).map(FormulaValue::Int).ok_or(FormulaError::Overflow)
        }
        (BinaryOp::Mod, Number::Int(a), Number::Int(b)) => floor_mod_int(a, b).map(FormulaValue::Int),
        (BinaryOp::Pow, Number::Int(a), Number::Int(b)) if b >= 0 => {
            let exponent = u32::try_from(b).map_err(|_| FormulaError::Overflow)?;
            a.checked_pow(exponent).map(FormulaValue::Int).ok_or(FormulaError::Overflow)
        }
        (BinaryOp::Pow, a, b) => {
            let (base, exponent) = (as_float(&a), as_float(&b));
            if base == 0.0 && exponent < 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            finite(base.powf(exponent))
        }
        (BinaryOp::Add, a, b) => finite(as_float(&a) + as_float(&b)),
        (BinaryOp::Sub, a, b) => finite(as_float(&a) - as_float(&b)),
        (BinaryOp::Mul, a, b) => finite(as_float(&a) * as_float(&b)),
        (BinaryOp::Mod, a, b) => floor_mod_float(as_float(&a), as_float(&b)),
    }
}

fn compare(op: CompareOp, left: &FormulaValue, right: &FormulaValue) -> FormulaResult<bool> {
    let ordering = match (number(left), number(right)) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => as_float(&a).partial_cmp(&as_float(&b)),
        _ => match (left, right) {
            (FormulaValue::Str(a), FormulaValue::Str(b)) => Some(a.cmp(b)),
            (FormulaValue::Null, FormulaValue::Null) => Some(Ordering::Equal),
            _ => None,
        },
    };

    match (op, ordering) {
        (CompareOp::Eq, ordering) => Ok(ordering == Some(Ordering::Equal)),
        (CompareOp::Ne, ordering) => Ok(ordering != Some(Ordering::Equal)),
        (_, None) if number(left).is_some() && number(right).is_some() => Ok(false),
        (_, None) => Err(FormulaError::Type {
            op: "comparison",
            left: left.type_name(),
            right: right.type_name(),
        }),
        (CompareOp::Lt, Some(o)) => Ok(o == Ordering::Less),
        (CompareOp::Le, Some(o)) => Ok(o != Ordering::Greater),
        (CompareOp::Gt, Some(o)) => Ok(o == Ordering::Greater),
        (CompareOp::Ge, Some(o)) => Ok(o != Ordering::Less),
    }
}

fn eval(expr: &FormulaExpr, context: &Map<String, Value>) -> FormulaResult<FormulaValue> {
    match expr {
        FormulaExpr::Int(n) => Ok(FormulaValue::Int(*n)),
        FormulaExpr::Float(f) => Ok(FormulaValue::Float(*f)),
        FormulaExpr::Bool(b) => Ok(FormulaValue::Bool(*b)),
        FormulaExpr::Str(s) => Ok(FormulaValue::Str(s.clone())),
        FormulaExpr::None => Ok(FormulaValue::Null),
        FormulaExpr::Name(name) => match context.get(name) {
            None => Ok(FormulaValue::Int(0)),
            Some(value) => FormulaValue::from_json(value).ok_or(FormulaError::Type {
                op: "name lookup",
                left: "container",
                right: "scalar",
            }),
        },
        FormulaExpr::Unary { op, operand } => {
            let value = eval(operand, context)?;
            match (op, number(&value)) {
                (UnaryOp::Pos, Some(Number::Int(n))) => Ok(FormulaValue::Int(n)),
                (UnaryOp::Pos, Some(Number::Float(f))) => Ok(FormulaValue::Float(f)),
                (UnaryOp::Neg, Some(Number::Int(n))) => {
                    n.checked_neg().map(FormulaValue::Int).ok_or(FormulaError::Overflow)
                }
                (UnaryOp::Neg, Some(Number::Float(f))) => Ok(FormulaValue::Float(-f)),
                (op, None) => Err(FormulaError::Type {
                    op: if *op == UnaryOp::Neg { "unary -" } else { "unary +" },
                    left: value.type_name(),
                    right: value.type_name(),
                }),
            }
        }
        FormulaExpr::Binary { op, left, right } => {
            let left = eval(left, context)?;
            let right = eval(right, context)?;
            arithmetic(*op, left, right)
        }
        FormulaExpr::Compare { left, ops } => {
            let mut current = eval(left, context)?;
            for (op, operand) in ops {
                let next = eval(operand, context)?;
                if !compare(*op, &current, &next)? {
                    return Ok(FormulaValue::Bool(false));
                }
                current = next;
            }
            Ok(FormulaValue::Bool(true))
        }
        FormulaExpr::Logical { op, left, right } => {
            let left = eval(left, context)?;
            match (op, left.is_truthy()) {
                (Logical::And, false) | (Logical::Or, true) => Ok(left),
                _ => eval(right, context),
            }
        }
        FormulaExpr::Not(inner) => Ok(FormulaValue::Bool(!eval(inner, context)?.is_truthy())),
        FormulaExpr::Call { .. } | FormulaExpr::Attribute { .. } | FormulaExpr::Subscript { .. } => {
            Err(FormulaError::Disallowed(expr.kind()))
        }
    }
}

/// Evaluate `formula` against one row. Identifiers missing from the row
/// evaluate to integer zero.
pub fn evaluate_row_formula(formula: &str, context: &Map<String, Value>) -> FormulaResult<FormulaValue> {
    evaluate_row(&parse(formula)?, context)
}

/// Like [`evaluate_row_formula`], for a formula parsed once and applied to
/// many rows.
pub fn evaluate_row(expr: &FormulaExpr, context: &Map<String, Value>) -> FormulaResult<FormulaValue> {
    expr.check(Stage::Row)?;
    eval(expr, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn eval_str(formula: &str, context: Value) -> FormulaResult<FormulaValue> {
        evaluate_row_formula(formula, &row(context))
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_str("a + b * 2", json!({"a": 2, "b": 3})), Ok(FormulaValue::Int(8)));
        assert_eq!(eval_str("7 / 2", json!({})), Ok(FormulaValue::Float(3.5)));
        assert_eq!(eval_str("2 ** 10", json!({})), Ok(FormulaValue::Int(1024)));
        assert_eq!(eval_str("2 ** -1", json!({})), Ok(FormulaValue::Float(0.5)));
        assert_eq!(eval_str("price * 1.5", json!({"price": 2})), Ok(FormulaValue::Float(3.0)));
    }

    #[test]
    fn test_floor_modulo() {
        assert_eq!(eval_str("-7 % 3", json!({})), Ok(FormulaValue::Int(2)));
        assert_eq!(eval_str("7 % -3", json!({})), Ok(FormulaValue::Int(-2)));
        assert_eq!(eval_str("-7.5 % 2", json!({})), Ok(FormulaValue::Float(0.5)));
    }

    #[test]
    fn test_missing_names_are_zero() {
        assert_eq!(eval_str("missing + 1", json!({})), Ok(FormulaValue::Int(1)));
    }

    #[test]
    fn test_errors() {
        assert_eq!(eval_str("a / b", json!({"a": 1, "b": 0})), Err(FormulaError::DivisionByZero));
        assert_eq!(
            eval_str("a * a", json!({"a": i64::MAX})),
            Err(FormulaError::Overflow)
        );
        assert!(matches!(
            eval_str("a + 1", json!({"a": null})),
            Err(FormulaError::Type { .. })
        ));
        assert!(matches!(
            eval_str("__import__('os').system('ls')", json!({})),
            Err(FormulaError::Disallowed("call"))
        ));
    }

    #[test]
    fn test_boolean_operators_return_operands() {
        assert_eq!(eval_str("0 or 5", json!({})), Ok(FormulaValue::Int(5)));
        assert_eq!(eval_str("a and b", json!({"a": 0, "b": 3})), Ok(FormulaValue::Int(0)));
        assert_eq!(eval_str("not a", json!({"a": ""})), Ok(FormulaValue::Bool(true)));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval_str("1 < a <= 3", json!({"a": 3})), Ok(FormulaValue::Bool(true)));
        assert_eq!(eval_str("1 < a <= 3", json!({"a": 4})), Ok(FormulaValue::Bool(false)));
        assert_eq!(
            eval_str("region == 'EU'", json!({"region": "EU"})),
            Ok(FormulaValue::Bool(true))
        );
        assert_eq!(eval_str("a == 'x'", json!({"a": 1})), Ok(FormulaValue::Bool(false)));
        assert!(eval_str("a < 'x'", json!({"a": 1})).is_err());
    }

    #[test]
    fn test_into_json() {
        assert_eq!(FormulaValue::Float(f64::NAN).into_json(), Value::Null);
        assert_eq!(FormulaValue::Int(3).into_json(), json!(3));
    }
}
