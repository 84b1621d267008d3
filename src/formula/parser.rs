//! Formula parser.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons, `+ -`,
//! `* / %`, unary `- +`, `**` (right-associative), then calls, attribute
//! access and subscripts.

use chumsky::input::ValueInput;
use chumsky::prelude::*;

use super::ast::{BinaryOp, CompareOp, FormulaExpr, Logical, UnaryOp};
use super::lexer::Token;

fn binary(op: BinaryOp, left: FormulaExpr, right: FormulaExpr) -> FormulaExpr {
    FormulaExpr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn logical(op: Logical, left: FormulaExpr, right: FormulaExpr) -> FormulaExpr {
    FormulaExpr::Logical {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

enum Postfix {
    Call(Vec<FormulaExpr>),
    Attribute(String),
    Subscript(FormulaExpr),
}

pub fn parser<'tokens, 'src: 'tokens, I>(
) -> impl Parser<'tokens, I, FormulaExpr, extra::Err<Rich<'tokens, Token<'src>, SimpleSpan>>>
where
    I: ValueInput<'tokens, Token = Token<'src>, Span = SimpleSpan>,
{
    recursive(|expr| {
        let number = select! {
            Token::Number(s) => s,
        }
        .try_map(|s, span| {
            if s.contains(['.', 'e', 'E']) {
                s.parse::<f64>()
                    .map(FormulaExpr::Float)
                    .map_err(|e| Rich::custom(span, e.to_string()))
            } else {
                s.parse::<i64>()
                    .map(FormulaExpr::Int)
                    .map_err(|_| Rich::custom(span, format!("integer literal {} is too large", s)))
            }
        })
        .labelled("number");

        let literal = select! {
            Token::Str(s) => FormulaExpr::Str(s.to_string()),
            Token::True => FormulaExpr::Bool(true),
            Token::False => FormulaExpr::Bool(false),
            Token::None => FormulaExpr::None,
        };

        let ident = select! {
            Token::Ident(s) => s.to_string(),
        }
        .labelled("identifier");

        let atom = choice((
            number,
            literal,
            ident.clone().map(FormulaExpr::Name),
            expr.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        ));

        let postfix_op = choice((
            expr.clone()
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .map(Postfix::Call),
            just(Token::Dot).ignore_then(ident).map(Postfix::Attribute),
            expr.clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .map(Postfix::Subscript),
        ));

        let postfix = atom.foldl(postfix_op.repeated(), |value, op| match op {
            Postfix::Call(args) => FormulaExpr::Call {
                func: Box::new(value),
                args,
            },
            Postfix::Attribute(attr) => FormulaExpr::Attribute {
                value: Box::new(value),
                attr,
            },
            Postfix::Subscript(index) => FormulaExpr::Subscript {
                value: Box::new(value),
                index: Box::new(index),
            },
        });

        // `-2 ** 2` is `-(2 ** 2)`; `2 ** -1` is allowed.
        let unary = recursive(|unary| {
            let power = postfix
                .clone()
                .then(just(Token::StarStar).ignore_then(unary.clone()).or_not())
                .map(|(base, exponent)| match exponent {
                    Some(exponent) => binary(BinaryOp::Pow, base, exponent),
                    None => base,
                });
            choice((
                just(Token::Minus).to(UnaryOp::Neg),
                just(Token::Plus).to(UnaryOp::Pos),
            ))
            .then(unary)
            .map(|(op, operand)| FormulaExpr::Unary {
                op,
                operand: Box::new(operand),
            })
            .or(power)
        });

        let product = unary.clone().foldl(
            choice((
                just(Token::Star).to(BinaryOp::Mul),
                just(Token::Slash).to(BinaryOp::Div),
                just(Token::Percent).to(BinaryOp::Mod),
            ))
            .then(unary)
            .repeated(),
            |left, (op, right)| binary(op, left, right),
        );

        let sum = product.clone().foldl(
            choice((
                just(Token::Plus).to(BinaryOp::Add),
                just(Token::Minus).to(BinaryOp::Sub),
            ))
            .then(product)
            .repeated(),
            |left, (op, right)| binary(op, left, right),
        );

        let compare_op = choice((
            just(Token::EqEq).to(CompareOp::Eq),
            just(Token::NotEq).to(CompareOp::Ne),
            just(Token::LtEq).to(CompareOp::Le),
            just(Token::GtEq).to(CompareOp::Ge),
            just(Token::Lt).to(CompareOp::Lt),
            just(Token::Gt).to(CompareOp::Gt),
        ));
        let comparison = sum
            .clone()
            .then(compare_op.then(sum).repeated().collect::<Vec<_>>())
            .map(|(left, ops)| {
                if ops.is_empty() {
                    left
                } else {
                    FormulaExpr::Compare {
                        left: Box::new(left),
                        ops,
                    }
                }
            });

        let negation = just(Token::Not)
            .repeated()
            .foldr(comparison, |_, operand| FormulaExpr::Not(Box::new(operand)));

        let conjunction = negation.clone().foldl(
            just(Token::And).ignore_then(negation).repeated(),
            |left, right| logical(Logical::And, left, right),
        );

        conjunction.clone().foldl(
            just(Token::Or).ignore_then(conjunction).repeated(),
            |left, right| logical(Logical::Or, left, right),
        )
    })
    .then_ignore(end())
}
