//! Schema contexts and the registry that holds them.

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::Catalog;
use crate::semantic::AggregationTable;
use crate::sql::dialect::Dialect;

/// Everything about a data source an engine needs besides the dataset:
/// its catalog, the dialect it speaks and the aggregations that dialect
/// can build.
#[derive(Debug, Clone)]
pub struct SchemaContext {
    pub catalog: Catalog,
    pub dialect: Dialect,
    pub aggregations: AggregationTable,
}

impl SchemaContext {
    pub fn new(catalog: Catalog, dialect: Dialect) -> Self {
        Self {
            catalog,
            aggregations: AggregationTable::for_dialect(dialect),
            dialect,
        }
    }
}

/// Named schema contexts shared between requests.
///
/// An explicit object rather than a process-wide table; callers decide its
/// lifetime and when to clear it.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    contexts: DashMap<String, Arc<SchemaContext>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a context.
    pub fn register(&self, name: &str, context: SchemaContext) -> Arc<SchemaContext> {
        let context = Arc::new(context);
        self.contexts.insert(name.to_string(), Arc::clone(&context));
        context
    }

    pub fn get(&self, name: &str) -> Option<Arc<SchemaContext>> {
        self.contexts.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<SchemaContext>> {
        self.contexts.remove(name).map(|(_, context)| context)
    }

    pub fn clear(&self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
