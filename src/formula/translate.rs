//! Query-stage translation of formulas into SQL expressions.

use std::collections::BTreeMap;

use super::ast::{BinaryOp, FormulaExpr, Stage, UnaryOp};
use super::{parse, FormulaError, FormulaResult};
use crate::sql::expr::{func, lit_bool, lit_float, lit_int, nullif, Expr, ExprExt};

/// Translate `formula` into SQL. Every identifier must name an entry of
/// `scope` (typically the metric aliases of the query); division becomes
/// `(a * 1.0) / NULLIF(b, 0)` and `**` becomes `POWER(a, b)`.
pub fn compile_query_expression(formula: &str, scope: &BTreeMap<String, Expr>) -> FormulaResult<Expr> {
    translate_query_expression(&parse(formula)?, scope)
}

/// Like [`compile_query_expression`], for a formula already parsed (and
/// size-checked) by the caller.
pub fn translate_query_expression(expr: &FormulaExpr, scope: &BTreeMap<String, Expr>) -> FormulaResult<Expr> {
    expr.check(Stage::Query)?;
    translate(expr, scope)
}

fn translate(expr: &FormulaExpr, scope: &BTreeMap<String, Expr>) -> FormulaResult<Expr> {
    Ok(match expr {
        FormulaExpr::Int(n) => lit_int(*n),
        FormulaExpr::Float(f) => lit_float(*f),
        FormulaExpr::Bool(b) => lit_bool(*b),
        FormulaExpr::Name(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| FormulaError::UnknownName(name.clone()))?,
        FormulaExpr::Unary { op, operand } => {
            let operand = translate(operand, scope)?;
            match op {
                UnaryOp::Neg => operand.neg(),
                UnaryOp::Pos => operand,
            }
        }
        FormulaExpr::Binary { op, left, right } => {
            let left = translate(left, scope)?;
            let right = translate(right, scope)?;
            match op {
                BinaryOp::Add => left.add(right),
                BinaryOp::Sub => left.sub(right),
                BinaryOp::Mul => left.mul(right),
                BinaryOp::Mod => left.modulo(right),
                BinaryOp::Div => Expr::Paren(Box::new(left.mul(lit_float(1.0))))
                    .div(nullif(right, lit_int(0))),
                BinaryOp::Pow => func("POWER", vec![left, right]),
            }
        }
        other => return Err(FormulaError::Disallowed(other.kind())),
    })
}
