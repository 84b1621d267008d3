//! Crate-level error type.
//!
//! Warning-class problems (a disallowed field, an unsupported lookup, a
//! formula that fails on one row) never surface here; they are collected in
//! [`crate::model::ExecutionResult::warnings`]. A [`QueryError`] aborts the
//! whole request.

use crate::filter::SecurityError;
use crate::model::CatalogError;
use crate::source::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Security violation: {0}")]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Aggregation '{name}' is not supported by {dialect}")]
    UnsupportedAggregation { name: String, dialect: String },

    #[error("No output fields are available")]
    NoOutputFields,

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueryError {
    pub fn is_security(&self) -> bool {
        matches!(self, QueryError::Security(_))
    }
}

pub type QueryResult<T> = Result<T, QueryError>;
