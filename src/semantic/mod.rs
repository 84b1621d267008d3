//! Semantic layer: dimensions, metrics and computed fields.
//!
//! The [`Resolver`] turns a request's dimension/metric/computed-field lists
//! into named items against a dataset definition. Metric aggregations are
//! built through an [`AggregationTable`] assembled per dialect, and every
//! output alias passes through [`sanitize_identifier`].

pub mod aggregation;
pub mod resolver;
pub mod sanitize;

pub use aggregation::{AggregateBuilder, AggregateOptions, AggregationTable};
pub use resolver::{dimension_alias, metric_alias, metric_field, Named, Resolution, Resolver};
pub use sanitize::sanitize_identifier;
