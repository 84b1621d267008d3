//! Formula syntax tree and the allowed-node check.
//!
//! The parser accepts a broader grammar than either evaluator supports
//! (calls, attribute access, subscripts) so that rejected input gets a
//! precise error instead of a syntax error.

use super::FormulaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logical {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaExpr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    Unary {
        op: UnaryOp,
        operand: Box<FormulaExpr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<FormulaExpr>,
        right: Box<FormulaExpr>,
    },
    /// `a < b <= c`: every adjacent pair must hold.
    Compare {
        left: Box<FormulaExpr>,
        ops: Vec<(CompareOp, FormulaExpr)>,
    },
    Logical {
        op: Logical,
        left: Box<FormulaExpr>,
        right: Box<FormulaExpr>,
    },
    Not(Box<FormulaExpr>),
    Call {
        func: Box<FormulaExpr>,
        args: Vec<FormulaExpr>,
    },
    Attribute {
        value: Box<FormulaExpr>,
        attr: String,
    },
    Subscript {
        value: Box<FormulaExpr>,
        index: Box<FormulaExpr>,
    },
}

/// Where a formula runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Translated to SQL over aggregate aliases.
    Query,
    /// Evaluated per materialized row.
    Row,
}

impl FormulaExpr {
    pub fn kind(&self) -> &'static str {
        match self {
            FormulaExpr::Int(_) => "integer",
            FormulaExpr::Float(_) => "float",
            FormulaExpr::Str(_) => "string",
            FormulaExpr::Bool(_) => "boolean",
            FormulaExpr::None => "None",
            FormulaExpr::Name(_) => "name",
            FormulaExpr::Unary { .. } => "unary operator",
            FormulaExpr::Binary { .. } => "binary operator",
            FormulaExpr::Compare { .. } => "comparison",
            FormulaExpr::Logical { .. } => "boolean operator",
            FormulaExpr::Not(_) => "not",
            FormulaExpr::Call { .. } => "call",
            FormulaExpr::Attribute { .. } => "attribute access",
            FormulaExpr::Subscript { .. } => "subscript",
        }
    }

    fn allowed_in(&self, stage: Stage) -> bool {
        match self {
            FormulaExpr::Int(_)
            | FormulaExpr::Float(_)
            | FormulaExpr::Bool(_)
            | FormulaExpr::Name(_)
            | FormulaExpr::Unary { .. }
            | FormulaExpr::Binary { .. } => true,
            FormulaExpr::Str(_)
            | FormulaExpr::None
            | FormulaExpr::Compare { .. }
            | FormulaExpr::Logical { .. }
            | FormulaExpr::Not(_) => stage == Stage::Row,
            FormulaExpr::Call { .. } | FormulaExpr::Attribute { .. } | FormulaExpr::Subscript { .. } => {
                false
            }
        }
    }

    fn children(&self) -> Vec<&FormulaExpr> {
        match self {
            FormulaExpr::Unary { operand, .. } => vec![operand.as_ref()],
            FormulaExpr::Binary { left, right, .. } | FormulaExpr::Logical { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            FormulaExpr::Compare { left, ops } => std::iter::once(left.as_ref())
                .chain(ops.iter().map(|(_, e)| e))
                .collect(),
            FormulaExpr::Not(inner) => vec![inner.as_ref()],
            FormulaExpr::Call { func, args } => std::iter::once(func.as_ref()).chain(args).collect(),
            FormulaExpr::Attribute { value, .. } => vec![value.as_ref()],
            FormulaExpr::Subscript { value, index } => vec![value.as_ref(), index.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Reject any node outside the stage's allowed set, and any dunder name.
    pub fn check(&self, stage: Stage) -> Result<(), FormulaError> {
        if let FormulaExpr::Name(name) = self {
            if name.starts_with("__") {
                return Err(FormulaError::ForbiddenName(name.clone()));
            }
        }
        if !self.allowed_in(stage) {
            return Err(FormulaError::Disallowed(self.kind()));
        }
        self.children().into_iter().try_for_each(|child| child.check(stage))
    }

    /// Height of the tree; a lone literal or name is 1. Walks with an
    /// explicit stack so arbitrarily deep input cannot overflow.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 1)];
        while let Some((node, depth)) = pending.pop() {
            deepest = deepest.max(depth);
            pending.extend(node.children().into_iter().map(|child| (child, depth + 1)));
        }
        deepest
    }

    /// Every identifier referenced, in first-seen order.
    pub fn names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        if let FormulaExpr::Name(name) = self {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        for child in self.children() {
            child.collect_names(names);
        }
    }
}
