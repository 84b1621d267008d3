//! Declarative inputs to the engine: the entity catalog, dataset
//! definitions, and the request/response payloads.

pub mod catalog;
pub mod dataset;
pub mod request;

pub use catalog::{
    Catalog, CatalogError, EntitySchema, FieldType, HistoryTable, Hop, PathTarget, Relation,
    RelationKind, ResolvedPath,
};
pub use dataset::{
    ComputedField, ComputedStage, DatasetDefinition, DatasetPolicy, Dimension,
    DimensionTransform, Metric,
};
pub use request::{CacheInfo, ExecutionMode, ExecutionResult, PivotTable, QueryRequest, Row};
