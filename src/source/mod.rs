//! Data sources the engine executes compiled queries against.
//!
//! A [`DataSource`] renders a [`Query`] in its own dialect and materializes
//! the result as JSON rows. Execution is synchronous: one blocking
//! round-trip per request.

mod sqlite;

pub use sqlite::SqliteSource;

use crate::model::Row;
use crate::sql::dialect::Dialect;
use crate::sql::query::Query;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Query was built for {query} but the source speaks {source_dialect}")]
    DialectMismatch {
        query: Dialect,
        source_dialect: Dialect,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Something that can run a SELECT and hand back rows.
pub trait DataSource {
    /// Dialect queries must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Run `query` and materialize every row. Column order follows the
    /// SELECT list.
    fn fetch(&self, query: &Query) -> SourceResult<Vec<Row>>;
}
