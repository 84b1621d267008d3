//! Dataset execution.
//!
//! A [`DatasetEngine`] binds one dataset definition to a [`SchemaContext`]
//! and runs requests against it:
//!
//! 1. every filter tree in play passes the security guard
//! 2. the result cache is consulted
//! 3. the request is planned into one SELECT and fetched
//! 4. row-stage computed fields and the pivot are applied
//! 5. the result is stored back in the cache
//!
//! A security violation stops the request before any SQL is built.

pub mod pivot;
pub mod plan;
pub mod registry;

pub use pivot::{pivot, PivotSpec};
pub use plan::QueryPlan;
pub use registry::{SchemaContext, SchemaRegistry};

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheStore};
use crate::config::Settings;
use crate::error::QueryResult;
use crate::filter::{FilterNode, SecurityGuard};
use crate::formula::evaluate_row;
use crate::model::{CacheInfo, DatasetDefinition, ExecutionResult, QueryRequest, Row};
use crate::source::{DataSource, SourceError};
use plan::{Planner, PostField};

pub struct DatasetEngine {
    dataset: DatasetDefinition,
    context: Arc<SchemaContext>,
    settings: Settings,
    guard: SecurityGuard,
    today: Option<NaiveDate>,
}

impl DatasetEngine {
    pub fn new(dataset: DatasetDefinition, context: Arc<SchemaContext>, settings: Settings) -> Self {
        let guard = SecurityGuard::new(settings.security.clone());
        Self {
            dataset,
            context,
            settings,
            guard,
            today: None,
        }
    }

    /// Pin the date relative filters (`today`, `last_n_days`, ...) resolve against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn dataset(&self) -> &DatasetDefinition {
        &self.dataset
    }

    pub fn context(&self) -> &SchemaContext {
        &self.context
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    /// Run every filter tree the request would compile through the guard:
    /// default filters, request filters, HAVING, and declared and ad-hoc
    /// metric filters.
    pub fn validate(&self, request: &QueryRequest) -> QueryResult<()> {
        let mut trees: Vec<&Value> = Vec::new();
        trees.extend(self.dataset.default_filters.as_ref());
        trees.extend(request.filters.as_ref());
        trees.extend(request.having.as_ref());
        trees.extend(self.dataset.metrics.iter().filter_map(|m| m.filter.as_ref()));
        trees.extend(
            request
                .metrics
                .iter()
                .flatten()
                .filter_map(|m| m.get("filter")),
        );

        // Parse warnings are reported by the planner.
        let mut ignored = Vec::new();
        for tree in trees {
            let node = FilterNode::parse(tree, &mut ignored);
            self.guard.validate(&node)?;
        }
        Ok(())
    }

    /// Validate and compile `request` without running it.
    pub fn plan(&self, request: &QueryRequest) -> QueryResult<QueryPlan> {
        self.validate(request)?;
        Planner::new(&self.dataset, &self.context, &self.settings, self.today()).build(request)
    }

    fn cache_ttl(&self, request: &QueryRequest) -> Option<u64> {
        if !self.settings.cache.enabled || !request.use_cache() {
            return None;
        }
        let ttl = self
            .dataset
            .metadata
            .cache_ttl_seconds
            .unwrap_or(self.settings.cache.default_ttl_seconds);
        (ttl > 0).then_some(ttl)
    }

    fn cached(&self, cache: &dyn CacheStore, key: &str) -> Option<ExecutionResult> {
        let stored = match cache.get(key) {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };
        match serde_json::from_value::<ExecutionResult>(stored) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable cache entry");
                None
            }
        }
    }

    /// Execute `request` against `source`, using `cache` when given.
    pub fn execute(
        &self,
        request: &QueryRequest,
        source: &dyn DataSource,
        cache: Option<&dyn CacheStore>,
    ) -> QueryResult<ExecutionResult> {
        self.validate(request)?;

        let ttl = self.cache_ttl(request);
        let key = match (cache, ttl) {
            (Some(_), Some(_)) => {
                let keyed = QueryRequest {
                    cache: None,
                    ..request.clone()
                };
                Some(cache_key(&self.dataset.code, &self.dataset.version(), &keyed)?)
            }
            _ => None,
        };

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            if let Some(mut result) = self.cached(cache, key) {
                debug!(key, "cache hit");
                result.cache.hit = true;
                return Ok(result);
            }
            debug!(key, "cache miss");
        }

        let plan = Planner::new(&self.dataset, &self.context, &self.settings, self.today())
            .build(request)?;
        if source.dialect() != self.context.dialect {
            return Err(SourceError::DialectMismatch {
                query: self.context.dialect,
                source_dialect: source.dialect(),
            }
            .into());
        }

        let mut rows = source.fetch(&plan.query)?;
        let mut warnings = plan.warnings;
        apply_post_fields(&mut rows, &plan.post_fields, &mut warnings);
        let pivot_table = plan.pivot.as_ref().map(|spec| pivot(&rows, spec));

        let result = ExecutionResult {
            mode: plan.mode,
            rows,
            columns: plan.columns,
            applied_filters: plan.applied_filters,
            ordering: plan.ordering,
            limit: plan.limit,
            offset: plan.offset,
            warnings,
            cache: CacheInfo {
                hit: false,
                key: key.clone(),
                ttl_seconds: ttl.filter(|_| key.is_some()),
            },
            pivot: pivot_table,
        };

        if let (Some(cache), Some(key), Some(ttl)) = (cache, key.as_deref(), ttl) {
            let stored = serde_json::to_value(&result)
                .map_err(crate::cache::CacheError::from)
                .and_then(|value| cache.set(key, &value, Duration::from_secs(ttl)));
            if let Err(e) = stored {
                warn!(key, error = %e, "cache write failed");
            }
        }

        info!(
            dataset = %self.dataset.code,
            mode = plan.mode.as_str(),
            rows = result.rows.len(),
            warnings = result.warnings.len(),
            "query complete"
        );
        Ok(result)
    }
}

/// Evaluate row-stage formulas in declaration order; later fields see the
/// values of earlier ones.
fn apply_post_fields(rows: &mut [Row], fields: &[PostField], warnings: &mut Vec<String>) {
    for field in fields {
        for (i, row) in rows.iter_mut().enumerate() {
            let value = match &field.expr {
                None => Value::Null,
                Some(expr) => match evaluate_row(expr, row) {
                    Ok(value) => value.into_json(),
                    Err(e) => {
                        warnings.push(format!(
                            "Computed field '{}' failed on row {}: {}",
                            field.name, i, e
                        ));
                        Value::Null
                    }
                },
            };
            row.insert(field.name.clone(), value);
        }
    }
}
