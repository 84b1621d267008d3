//! # Mantis Query
//!
//! Dynamic filter trees and semantic aggregations over relational data,
//! compiled to parameter-free, escaped SQL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │      QueryRequest (filters, dimensions, metrics, ...)    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [filter::SecurityGuard]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Filter trees within depth, clause and regex limits     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [semantic::Resolver + filter::FilterCompiler]
//! ┌─────────────────────────────────────────────────────────┐
//! │      sql::Query (joins, WHERE, GROUP BY, HAVING, ...)    │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [source::DataSource]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Rows + row-stage formulas + pivot → ExecutionResult    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Results are memoized through a [`cache::CacheStore`] keyed by dataset
//! version and a hash of the canonical request.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod formula;
pub mod model;
pub mod semantic;
pub mod source;
pub mod sql;

pub use engine::{DatasetEngine, QueryPlan, SchemaContext, SchemaRegistry};
pub use error::{QueryError, QueryResult};

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::cache::{CacheStore, MemoryCache, SqliteCache};
    pub use crate::config::Settings;
    pub use crate::engine::{DatasetEngine, QueryPlan, SchemaContext, SchemaRegistry};
    pub use crate::error::{QueryError, QueryResult};
    pub use crate::filter::{FilterCompiler, FilterNode, FilterSpec, SecurityGuard, SecurityLimits};
    pub use crate::model::{
        Catalog, DatasetDefinition, ExecutionMode, ExecutionResult, QueryRequest, Row,
    };
    pub use crate::source::{DataSource, SqliteSource};
    pub use crate::sql::{Dialect, SqlDialect};
}
