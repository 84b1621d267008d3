//! Restricted arithmetic formulas for computed fields.
//!
//! Formulas are parsed once into a [`FormulaExpr`] and then either
//! translated to SQL over aggregate aliases ([`compile_query_expression`])
//! or evaluated against a materialized row ([`evaluate_row_formula`]).
//! Both paths reject every node outside a fixed allowed set before doing
//! anything else.
//!
//! ```text
//! revenue - cost                  query or row stage
//! (won / total) * 100             division is NULL-safe in SQL
//! amount > 100 and region == 'EU' row stage only
//! ```

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod translate;

pub use ast::{FormulaExpr, Stage};
pub use eval::{evaluate_row, evaluate_row_formula, FormulaValue};
pub use translate::{compile_query_expression, translate_query_expression};

/// Size bounds checked before a formula is parsed or walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FormulaLimits {
    /// Maximum source length in characters.
    pub max_length: usize,
    /// Maximum nesting: bracket depth plus prefix and `**` operators before
    /// parsing, tree height after.
    pub max_depth: usize,
}

impl Default for FormulaLimits {
    fn default() -> Self {
        Self {
            max_length: 1000,
            max_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("Syntax error in formula: {0}")]
    Syntax(String),

    #[error("Unsupported expression in formula: {0}")]
    Disallowed(&'static str),

    #[error("Identifier '{0}' is not allowed")]
    ForbiddenName(String),

    #[error("Unknown identifier '{0}'")]
    UnknownName(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Numeric overflow")]
    Overflow,

    #[error("Unsupported operand types for {op}: {left} and {right}")]
    Type {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("Math domain error")]
    Domain,

    #[error("Formula is {length} characters long (maximum {max})")]
    TooLong { length: usize, max: usize },

    #[error("Formula nesting exceeds the maximum depth of {max}")]
    TooDeep { max: usize },
}

pub type FormulaResult<T> = Result<T, FormulaError>;

/// Parse a formula under the default [`FormulaLimits`] without checking
/// it against either stage.
pub fn parse(source: &str) -> FormulaResult<FormulaExpr> {
    parse_with_limits(source, &FormulaLimits::default())
}

/// Upper bound on both the bracket nesting of `tokens` and the height of
/// the tree they parse into.
///
/// Every operator adds at most one level over the operands of its bracket
/// group; a group stands in its parent as a single operand.
fn nesting_bound(tokens: &[(lexer::Token<'_>, chumsky::span::SimpleSpan)]) -> usize {
    use lexer::Token;

    // (operators in the group, tallest child group)
    let mut groups = vec![(0usize, 0usize)];
    let mut brackets = 0;
    let mut previous: Option<&Token<'_>> = None;
    for (token, _) in tokens {
        match token {
            Token::LParen | Token::LBracket => {
                // A call or subscript wraps what precedes it.
                if matches!(
                    previous,
                    Some(Token::Ident(_) | Token::Str(_) | Token::RParen | Token::RBracket)
                ) {
                    if let Some(group) = groups.last_mut() {
                        group.0 += 1;
                    }
                }
                groups.push((0, 0));
                brackets = brackets.max(groups.len() - 1);
            }
            Token::RParen | Token::RBracket => {
                if groups.len() > 1 {
                    if let Some((operators, child)) = groups.pop() {
                        let height = operators + child.max(1);
                        if let Some(parent) = groups.last_mut() {
                            parent.1 = parent.1.max(height);
                        }
                    }
                }
            }
            Token::Ident(_)
            | Token::Number(_)
            | Token::Str(_)
            | Token::True
            | Token::False
            | Token::None
            | Token::Comma => {}
            _ => {
                if let Some(group) = groups.last_mut() {
                    group.0 += 1;
                }
            }
        }
        previous = Some(token);
    }
    // Unclosed groups fail to parse; bound them anyway.
    let height = groups
        .into_iter()
        .rev()
        .fold(0, |inner, (operators, child)| operators + child.max(inner).max(1));
    height.max(brackets)
}

/// Parse a formula, rejecting it before the parser runs when it exceeds
/// `limits`.
pub fn parse_with_limits(source: &str, limits: &FormulaLimits) -> FormulaResult<FormulaExpr> {
    use chumsky::input::Input;
    use chumsky::span::SimpleSpan;
    use chumsky::Parser as _;

    let length = source.chars().count();
    if length > limits.max_length {
        return Err(FormulaError::TooLong {
            length,
            max: limits.max_length,
        });
    }

    let (tokens, lex_errs) = lexer::lexer().parse(source).into_output_errors();
    if let Some(e) = lex_errs.into_iter().next() {
        return Err(FormulaError::Syntax(e.to_string()));
    }
    let tokens = tokens.unwrap_or_default();
    if nesting_bound(&tokens) > limits.max_depth {
        return Err(FormulaError::TooDeep {
            max: limits.max_depth,
        });
    }

    let len = source.len();
    let eoi: SimpleSpan = (len..len).into();
    let token_stream = tokens
        .as_slice()
        .map(eoi, |(tok, span): &(lexer::Token<'_>, SimpleSpan)| (tok, span));

    let (expr, parse_errs) = parser::parser().parse(token_stream).into_output_errors();
    if let Some(e) = parse_errs.into_iter().next() {
        return Err(FormulaError::Syntax(e.to_string()));
    }
    let expr = expr.ok_or_else(|| FormulaError::Syntax("empty formula".to_string()))?;
    if expr.depth() > limits.max_depth {
        return Err(FormulaError::TooDeep {
            max: limits.max_depth,
        });
    }
    Ok(expr)
}
