//! Type-safe SQL generation.
//!
//! Filters, aggregations and computed fields are built as [`expr::Expr`]
//! trees inside a [`query::Query`] and rendered per [`dialect::Dialect`].
//! Client values only ever enter the output as escaped literal tokens.

pub mod dialect;
pub mod expr;
pub mod query;
pub mod token;

pub use dialect::{DateGrain, DatePart, Dialect, SqlDialect};
pub use expr::{Expr, ExprExt, Literal};
pub use query::{OrderByExpr, Query, SelectExpr, TableRef};
