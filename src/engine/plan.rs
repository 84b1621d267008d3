//! Build the SELECT for one request.
//!
//! Planning runs in a fixed order so join aliases are stable: default
//! filters, request filters and quick search first, then output columns,
//! metric sub-filters, HAVING and ordering. Every piece shares one
//! [`JoinPlanner`], so a relation used by a filter and a dimension is
//! joined once.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::Value;

use super::pivot::PivotSpec;
use super::registry::SchemaContext;
use crate::config::Settings;
use crate::error::{QueryError, QueryResult};
use crate::filter::joins::{correlated, entity_table};
use crate::filter::{FilterCompiler, FilterNode, FilterSpec, JoinPlanner};
use crate::formula::{parse_with_limits, translate_query_expression, FormulaExpr, Stage};
use crate::model::{
    ComputedField, ComputedStage, DatasetDefinition, Dimension, DimensionTransform, EntitySchema,
    ExecutionMode, Metric, PathTarget, QueryRequest, ResolvedPath,
};
use crate::semantic::{metric_field, AggregateOptions, AggregationTable, Named, Resolver};
use crate::sql::dialect::SqlDialect;
use crate::sql::expr::{and_all, case_when, col, func, lit_int, lower, table_col, upper, Expr, ExprExt};
use crate::sql::query::{OrderByExpr, Query, SelectExpr};

/// A row-stage computed field, parsed once.
#[derive(Debug, Clone)]
pub(crate) struct PostField {
    pub name: String,
    /// `None` when the formula failed to parse or uses a disallowed node;
    /// the field is then null on every row.
    pub expr: Option<FormulaExpr>,
}

/// A compiled request, ready to run.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub mode: ExecutionMode,
    pub query: Query,
    /// Output columns in order, including row-stage computed fields.
    pub columns: Vec<String>,
    pub applied_filters: Vec<FilterSpec>,
    pub ordering: Vec<String>,
    pub limit: u64,
    pub offset: u64,
    pub warnings: Vec<String>,
    pub(crate) post_fields: Vec<PostField>,
    pub(crate) pivot: Option<PivotSpec>,
}

pub(crate) struct Planner<'a> {
    dataset: &'a DatasetDefinition,
    context: &'a SchemaContext,
    settings: &'a Settings,
    today: NaiveDate,
    joins: JoinPlanner,
    root: String,
    /// Correlated metric subqueries built so far.
    related: usize,
    warnings: Vec<String>,
}

/// `-field` sorts descending.
fn split_ordering(term: &str) -> (&str, bool) {
    match term.trim().strip_prefix('-') {
        Some(field) => (field.trim(), true),
        None => (term.trim().trim_start_matches('+'), false),
    }
}

/// Aggregations that split into one value per root row and a combination
/// of those values per group: `(per row, per group)`.
fn rollup(aggregation: &str, options: &AggregateOptions) -> Option<(&'static str, &'static str)> {
    match AggregationTable::canonical(aggregation).as_str() {
        "count" if !options.get("distinct").and_then(Value::as_bool).unwrap_or(false) => {
            Some(("count", "sum"))
        }
        "sum" => Some(("sum", "sum")),
        "min" => Some(("min", "min")),
        "max" => Some(("max", "max")),
        _ => None,
    }
}

fn order_expr(expr: Expr, descending: bool) -> OrderByExpr {
    if descending {
        OrderByExpr::desc(expr)
    } else {
        OrderByExpr::asc(expr)
    }
}

impl<'a> Planner<'a> {
    pub fn new(
        dataset: &'a DatasetDefinition,
        context: &'a SchemaContext,
        settings: &'a Settings,
        today: NaiveDate,
    ) -> Self {
        let joins = JoinPlanner::new("t");
        let root = joins.root_alias();
        Self {
            dataset,
            context,
            settings,
            today,
            joins,
            root,
            related: 0,
            warnings: Vec::new(),
        }
    }

    /// Compiler for client-supplied trees: the dataset's full policy.
    fn request_compiler(&self) -> FilterCompiler<'a> {
        FilterCompiler::for_dataset(&self.context.catalog, self.context.dialect, self.dataset)
            .with_today(self.today)
    }

    /// Compiler for trees the dataset itself declares (default filters,
    /// declared metric filters): any path the catalog resolves.
    fn trusted_compiler(&self) -> FilterCompiler<'a> {
        FilterCompiler::new(&self.context.catalog, self.context.dialect, &self.dataset.source)
            .with_subqueries(self.dataset.metadata.allowed_subqueries.clone())
            .with_today(self.today)
    }

    fn parse_tree(&mut self, value: &Value) -> FilterNode {
        FilterNode::parse(value, &mut self.warnings)
    }

    pub fn build(mut self, request: &QueryRequest) -> QueryResult<QueryPlan> {
        let entity = self.context.catalog.entity(&self.dataset.source)?;
        let (where_clause, applied_filters) = self.where_clause(request);
        let (limit, offset) = self.limits(request);

        let plan = match request.mode {
            ExecutionMode::Records => self.records(request, entity)?,
            ExecutionMode::Aggregate => self.aggregate(request)?,
        };

        let pivot = match (&request.pivot, request.mode) {
            (None, _) => None,
            (Some(_), ExecutionMode::Records) => {
                self.warnings
                    .push("Pivot is only available in aggregate mode".to_string());
                None
            }
            (Some(spec), ExecutionMode::Aggregate) => match PivotSpec::parse(spec) {
                Ok(spec) => Some(spec),
                Err(message) => {
                    self.warnings.push(message);
                    None
                }
            },
        };

        let mut query = Query::new()
            .select(plan.select)
            .from(entity_table(entity, &self.root));
        query.joins = self.joins.into_joins();
        if let Some(predicate) = where_clause {
            query = query.filter(predicate);
        }
        if !plan.group_by.is_empty() {
            query = query.group_by(plan.group_by);
        }
        if let Some(having) = plan.having {
            query = query.having(having);
        }
        if !plan.order_by.is_empty() {
            query = query.order_by(plan.order_by);
        }
        query = query.limit(limit);
        if offset > 0 {
            query = query.offset(offset);
        }

        Ok(QueryPlan {
            mode: request.mode,
            query,
            columns: plan.columns,
            applied_filters,
            ordering: plan.ordering,
            limit,
            offset,
            warnings: self.warnings,
            post_fields: plan.post_fields,
            pivot,
        })
    }

    /// Default filters, request filters and quick search, ANDed.
    fn where_clause(&mut self, request: &QueryRequest) -> (Option<Expr>, Vec<FilterSpec>) {
        let mut parts = Vec::new();
        let mut applied = Vec::new();

        if let Some(defaults) = &self.dataset.default_filters {
            let node = self.parse_tree(defaults);
            let compiled = self.trusted_compiler().compile_with(&node, &mut self.joins);
            self.warnings.extend(compiled.warnings);
            applied.extend(compiled.specs);
            parts.extend(compiled.predicate);
        }

        if let Some(filters) = &request.filters {
            let node = self.parse_tree(filters);
            let compiled = self.request_compiler().compile_with(&node, &mut self.joins);
            self.warnings.extend(compiled.warnings);
            applied.extend(compiled.specs);
            parts.extend(compiled.predicate);
        }

        if let Some(term) = &request.quick {
            let compiled = self.request_compiler().quick_search(term, &mut self.joins);
            self.warnings.extend(compiled.warnings);
            parts.extend(compiled.predicate);
        }

        for spec in &mut applied {
            spec.nested = None;
        }
        (and_all(parts), applied)
    }

    fn limits(&mut self, request: &QueryRequest) -> (u64, u64) {
        let max_limit = self
            .dataset
            .metadata
            .max_limit
            .unwrap_or(self.settings.engine.default_max_limit);
        let preview = if self.dataset.preview_limit > 0 {
            self.dataset.preview_limit
        } else {
            self.settings.engine.default_preview_limit
        };
        let limit = match request.limit {
            None => preview.min(max_limit),
            Some(requested) if requested > max_limit => {
                self.warnings.push(format!(
                    "Limit {} exceeds the maximum of {}; using {}",
                    requested, max_limit, max_limit
                ));
                max_limit
            }
            Some(requested) => requested,
        };
        (limit, request.offset.unwrap_or(0))
    }

    /// Resolve `path` to a column expression, joining what it needs. Paths
    /// through a to-many relation are refused: the join would repeat rows.
    fn column(&mut self, path: &str) -> QueryResult<Expr> {
        let resolved = self.context.catalog.resolve(&self.dataset.source, path)?;
        if resolved.first_to_many().is_some() {
            return Err(QueryError::InvalidRequest(format!(
                "'{}' crosses a to-many relation",
                path
            )));
        }
        let alias = self.joins.join_hops(&self.root, &resolved.hops);
        self.target_column(&resolved, &alias)
    }

    /// A path ending on a to-many relation stands for the related primary
    /// key.
    fn target_column(&self, resolved: &ResolvedPath, alias: &str) -> QueryResult<Expr> {
        Ok(match &resolved.target {
            PathTarget::Column { column, .. } => table_col(alias, column),
            PathTarget::Relation { entity } => {
                table_col(alias, &self.context.catalog.entity(entity)?.primary_key)
            }
        })
    }

    /// `aggregation` over the rows behind the to-many hop at `index`, as a
    /// scalar subquery correlated with one root row. Joining the relation
    /// instead would repeat each root row once per related row.
    fn related_aggregate(
        &mut self,
        resolved: &ResolvedPath,
        index: usize,
        aggregation: &str,
        options: &AggregateOptions,
    ) -> QueryResult<Expr> {
        let owner = self.joins.join_hops(&self.root, &resolved.hops[..index]);
        self.related += 1;
        let alias = format!("m{}", self.related);
        let mut inner = JoinPlanner::new(&format!("{}_", alias));
        let last = inner.join_hops(&alias, &resolved.hops[index + 1..]);
        let per_row = self
            .context
            .aggregations
            .build(aggregation, Some(self.target_column(resolved, &last)?), options)
            .map_err(QueryError::InvalidRequest)?;

        let mut query = correlated(&resolved.hops[index], &owner, &alias).select(vec![per_row]);
        query.joins = inner.into_joins();
        Ok(Expr::Subquery(Box::new(query)))
    }

    // -------------------------------------------------------------------
    // Records mode
    // -------------------------------------------------------------------

    /// `record_fields`, else `allowed_fields`, else the primary key.
    fn record_allowlist(&self, entity: &EntitySchema) -> Vec<String> {
        let policy = &self.dataset.metadata;
        if !policy.record_fields.is_empty() {
            return policy.record_fields.clone();
        }
        match &policy.allowed_fields {
            Some(fields) if !fields.is_empty() => fields.clone(),
            _ => vec![entity.primary_key.clone()],
        }
    }

    fn records(&mut self, request: &QueryRequest, entity: &EntitySchema) -> QueryResult<Shape> {
        let allowlist = self.record_allowlist(entity);
        let fields: Vec<String> = match &request.fields {
            None => allowlist.clone(),
            Some(requested) => {
                let mut fields = Vec::new();
                for field in requested {
                    if !allowlist.contains(field) {
                        self.warnings
                            .push(format!("Field '{}' is not available in records mode", field));
                    } else if !fields.contains(field) {
                        fields.push(field.clone());
                    }
                }
                fields
            }
        };

        let mut shape = Shape::default();
        for field in fields {
            let expr = self.column(&field)?;
            shape.select.push(expr.alias(&field));
            shape.columns.push(field);
        }
        if shape.select.is_empty() {
            return Err(QueryError::NoOutputFields);
        }

        for term in self.ordering_terms(request) {
            let (field, descending) = split_ordering(&term);
            if !allowlist.iter().any(|f| f.as_str() == field) {
                self.warnings
                    .push(format!("Ordering on '{}' is not allowed", field));
                continue;
            }
            let expr = self.column(field)?;
            shape.order_by.push(order_expr(expr, descending));
            shape.ordering.push(term);
        }
        Ok(shape)
    }

    fn ordering_terms(&self, request: &QueryRequest) -> Vec<String> {
        request
            .ordering
            .clone()
            .unwrap_or_else(|| self.dataset.ordering.clone())
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .collect()
    }

    // -------------------------------------------------------------------
    // Aggregate mode
    // -------------------------------------------------------------------

    /// Declared items fail the request; ad-hoc ones are dropped with a
    /// warning.
    fn soft<T>(&mut self, ad_hoc: bool, what: &str, result: QueryResult<T>) -> QueryResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if ad_hoc => {
                self.warnings.push(format!("{} dropped: {}", what, e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn claim_alias(&mut self, aliases: &BTreeMap<String, Expr>, name: &str) -> bool {
        if aliases.contains_key(name) {
            self.warnings
                .push(format!("Duplicate output alias '{}' ignored", name));
            return false;
        }
        true
    }

    fn dimension_expr(&mut self, dimension: &Dimension) -> QueryResult<Expr> {
        let expr = self.column(&dimension.field)?;
        let dialect = self.context.dialect;
        Ok(match dimension.transform {
            None => expr,
            Some(DimensionTransform::Lower) => lower(expr),
            Some(DimensionTransform::Upper) => upper(expr),
            Some(DimensionTransform::Trunc(grain)) => dialect.date_trunc(grain, expr),
            Some(DimensionTransform::Extract(part)) => dialect.date_part(part, expr),
        })
    }

    fn metric_expr(&mut self, metric: &Named<Metric>) -> QueryResult<Expr> {
        let def = &metric.def;
        let context = self.context;
        let mut aggregation = def.aggregation.as_str();
        // A summed count over no rows is NULL, where COUNT would give 0.
        let mut empty_as_zero = false;
        let arg = match metric_field(def) {
            None => None,
            Some(field) => {
                let resolved = context.catalog.resolve(&self.dataset.source, field)?;
                match resolved.first_to_many() {
                    None => {
                        let alias = self.joins.join_hops(&self.root, &resolved.hops);
                        Some(self.target_column(&resolved, &alias)?)
                    }
                    Some(index) => {
                        let (per_row, per_group) = rollup(&def.aggregation, &def.options).ok_or_else(|| {
                            QueryError::InvalidRequest(format!(
                                "'{}' crosses a to-many relation; only count, sum, min and max can aggregate it",
                                field
                            ))
                        })?;
                        aggregation = per_group;
                        empty_as_zero = per_row == "count";
                        Some(self.related_aggregate(&resolved, index, per_row, &def.options)?)
                    }
                }
            }
        };

        let condition = match &def.filter {
            None => None,
            Some(filter) => {
                let node = self.parse_tree(filter);
                let compiler = if metric.ad_hoc {
                    self.request_compiler()
                } else {
                    self.trusted_compiler()
                };
                let compiled = compiler.compile_with(&node, &mut self.joins);
                self.warnings.extend(compiled.warnings);
                compiled.predicate
            }
        };

        let aggregations = &context.aggregations;
        let built = match condition {
            None => aggregations.build(aggregation, arg, &def.options),
            Some(condition) if context.dialect.supports_aggregate_filter() => aggregations
                .build(aggregation, arg, &def.options)
                .map(|agg| agg.filter_where(condition)),
            Some(condition) => {
                let scoped = case_when(condition, arg.unwrap_or_else(|| lit_int(1)), None);
                aggregations.build(aggregation, Some(scoped), &def.options)
            }
        };
        let built = built.map_err(QueryError::InvalidRequest)?;
        Ok(if empty_as_zero {
            func("COALESCE", vec![built, lit_int(0)])
        } else {
            built
        })
    }

    fn aggregate(&mut self, request: &QueryRequest) -> QueryResult<Shape> {
        let context = self.context;
        let resolver = Resolver::new(self.dataset, &context.aggregations);
        let dimensions = resolver.resolve_dimensions(request.dimensions.as_deref());
        let metrics = resolver.resolve_metrics(request.metrics.as_deref())?;
        let computed = resolver.resolve_computed_fields(request.computed_fields.as_deref());
        self.warnings.extend(dimensions.warnings);
        self.warnings.extend(metrics.warnings);
        self.warnings.extend(computed.warnings);

        let mut shape = Shape::default();
        let mut aliases: BTreeMap<String, Expr> = BTreeMap::new();

        for dimension in &dimensions.items {
            if !self.claim_alias(&aliases, &dimension.name) {
                continue;
            }
            let what = format!("Dimension '{}'", dimension.name);
            let result = self.dimension_expr(&dimension.def);
            let Some(expr) = self.soft(dimension.ad_hoc, &what, result)? else {
                continue;
            };
            shape.select.push(expr.clone().alias(&dimension.name));
            shape.group_by.push(expr.clone());
            shape.columns.push(dimension.name.clone());
            aliases.insert(dimension.name.clone(), expr);
        }

        for metric in &metrics.items {
            if !self.claim_alias(&aliases, &metric.name) {
                continue;
            }
            let what = format!("Metric '{}'", metric.name);
            let result = self.metric_expr(metric);
            let Some(expr) = self.soft(metric.ad_hoc, &what, result)? else {
                continue;
            };
            shape.select.push(expr.clone().alias(&metric.name));
            shape.columns.push(metric.name.clone());
            aliases.insert(metric.name.clone(), expr);
        }

        if shape.select.is_empty() {
            return Err(QueryError::NoOutputFields);
        }

        self.computed_fields(&computed.items, &mut aliases, &mut shape);

        if let Some(having) = &request.having {
            let node = self.parse_tree(having);
            let compiled = self.request_compiler().compile_having(&node, &aliases);
            self.warnings.extend(compiled.warnings);
            shape.having = compiled.predicate;
        }

        for term in self.ordering_terms(request) {
            let (field, descending) = split_ordering(&term);
            if !aliases.contains_key(field) {
                self.warnings
                    .push(format!("Ordering on '{}' is not allowed", field));
                continue;
            }
            shape.order_by.push(order_expr(col(field), descending));
            shape.ordering.push(term);
        }

        Ok(shape)
    }

    /// Query-stage fields become SQL over the aliases defined so far, so
    /// each may build on the previous ones. Row-stage fields are parsed
    /// here and evaluated after the fetch.
    fn computed_fields(
        &mut self,
        fields: &[Named<ComputedField>],
        aliases: &mut BTreeMap<String, Expr>,
        shape: &mut Shape,
    ) {
        for field in fields {
            if !self.claim_alias(aliases, &field.name)
                || shape.post_fields.iter().any(|p| p.name == field.name)
            {
                continue;
            }
            let limits = self.settings.security.formula_limits();
            let parsed = parse_with_limits(&field.def.formula, &limits);
            match field.def.stage {
                ComputedStage::Query => match parsed
                    .and_then(|expr| translate_query_expression(&expr, &*aliases))
                {
                    Ok(expr) => {
                        shape.select.push(SelectExpr::new(expr.clone()).with_alias(&field.name));
                        shape.columns.push(field.name.clone());
                        aliases.insert(field.name.clone(), expr);
                    }
                    Err(e) => self
                        .warnings
                        .push(format!("Computed field '{}' dropped: {}", field.name, e)),
                },
                ComputedStage::Post => {
                    let expr = match parsed.and_then(|expr| expr.check(Stage::Row).map(|_| expr)) {
                        Ok(expr) => Some(expr),
                        Err(e) => {
                            self.warnings.push(format!(
                                "Computed field '{}' will be null: {}",
                                field.name, e
                            ));
                            None
                        }
                    };
                    shape.columns.push(field.name.clone());
                    shape.post_fields.push(PostField {
                        name: field.name.clone(),
                        expr,
                    });
                }
            }
        }
    }
}

/// Mode-specific parts of the query.
#[derive(Debug, Default)]
struct Shape {
    select: Vec<SelectExpr>,
    columns: Vec<String>,
    group_by: Vec<Expr>,
    having: Option<Expr>,
    order_by: Vec<OrderByExpr>,
    ordering: Vec<String>,
    post_fields: Vec<PostField>,
}
