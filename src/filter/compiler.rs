//! Compile filter trees into SQL predicates.
//!
//! The compiler resolves every leaf's field path against the catalog, checks
//! it against the dataset's field and lookup policy, and emits an [`Expr`].
//! Leaves that fail any check are dropped with a warning; the rest of the
//! tree still compiles. Security limits are enforced beforehand by
//! [`super::SecurityGuard`].
//!
//! To-one hops are joined through the shared [`JoinPlanner`]. A to-many hop
//! never becomes a join: it is compiled to a correlated subquery so rows of
//! the source entity are not multiplied.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Local, NaiveDate};
use serde_json::Value;
use tracing::debug;

use super::joins::{correlated, entity_table, JoinPlanner};
use super::lookup::{self, Comparison, Lookup, Quantifier};
use super::temporal;
use super::tree::{FilterNode, FilterSpec};
use crate::model::{Catalog, DatasetDefinition, Hop, PathTarget, RelationKind, ResolvedPath};
use crate::sql::dialect::Dialect;
use crate::sql::expr::{
    and_all, case_when, count_star, dense_rank, exists, lit_date, lit_int, not_exists, or_all,
    rank, row_number, table_col, Expr, ExprExt, WindowOrderBy,
};
use crate::sql::query::{Join, Query, SelectExpr, TableRef};

/// Which field paths a filter may reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Only the listed paths.
    Listed(BTreeSet<String>),
    /// Any path that resolves on the source entity.
    Any,
}

impl FieldPolicy {
    /// `allowed_fields`, else every field the dataset declares, else any
    /// path when the dataset allows ad-hoc queries.
    pub fn for_dataset(dataset: &DatasetDefinition) -> Self {
        let policy = &dataset.metadata;
        if let Some(fields) = &policy.allowed_fields {
            return FieldPolicy::Listed(fields.iter().cloned().collect());
        }

        let declared: BTreeSet<String> = dataset
            .declared_fields()
            .into_iter()
            .chain(policy.record_fields.iter().cloned())
            .chain(policy.quick_search_fields.iter().cloned())
            .collect();
        if !declared.is_empty() {
            FieldPolicy::Listed(declared)
        } else if policy.allow_ad_hoc {
            FieldPolicy::Any
        } else {
            FieldPolicy::Listed(BTreeSet::new())
        }
    }

    pub fn allows(&self, path: &str) -> bool {
        match self {
            FieldPolicy::Any => true,
            FieldPolicy::Listed(fields) => fields.contains(path),
        }
    }

    /// A relation is usable when it, or any field below it, is listed.
    pub fn allows_relation(&self, path: &str) -> bool {
        match self {
            FieldPolicy::Any => true,
            FieldPolicy::Listed(fields) => {
                let prefix = format!("{}__", path);
                fields.contains(path) || fields.iter().any(|f| f.starts_with(&prefix))
            }
        }
    }
}

/// Output of one compilation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledFilter {
    /// `None` when nothing survived.
    pub predicate: Option<Expr>,
    /// Top-level leaves that compiled, in tree order.
    pub specs: Vec<FilterSpec>,
    pub warnings: Vec<String>,
    /// Joins required by the predicate. Empty when the caller supplied its
    /// own planner.
    pub joins: Vec<Join>,
}

/// Fields visible inside the current scope.
#[derive(Debug, Clone)]
enum ScopeFields {
    Policy,
    /// An `in_subquery` projection: only these fields of the subquery entity.
    Listed(Vec<String>),
}

#[derive(Debug, Clone)]
struct Scope {
    entity: String,
    alias: String,
    /// Path from the source entity, used for allowlist checks.
    prefix: String,
    fields: ScopeFields,
}

#[derive(Debug, Default)]
struct CompileState {
    warnings: Vec<String>,
    specs: Vec<FilterSpec>,
    subqueries: usize,
}

impl CompileState {
    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }

    fn next_alias(&mut self) -> String {
        self.subqueries += 1;
        format!("s{}", self.subqueries)
    }
}

/// Fold a tree into one expression, compiling leaves with `leaf`.
///
/// Empty branches and failed leaves vanish; a branch left with nothing is
/// `None` rather than a constant.
pub(crate) fn fold_tree(
    node: &FilterNode,
    leaf: &mut dyn FnMut(&FilterSpec) -> Option<Expr>,
) -> Option<Expr> {
    match node {
        FilterNode::Leaf(spec) => {
            let expr = leaf(spec)?;
            Some(if spec.negate { expr.not() } else { expr })
        }
        FilterNode::And(children) => {
            let parts: Vec<Expr> = children.iter().filter_map(|c| fold_tree(c, &mut *leaf)).collect();
            and_all(parts)
        }
        FilterNode::Or(children) => {
            let parts: Vec<Expr> = children.iter().filter_map(|c| fold_tree(c, &mut *leaf)).collect();
            or_all(parts)
        }
        FilterNode::Not(inner) => fold_tree(inner, leaf).map(ExprExt::not),
    }
}

pub struct FilterCompiler<'a> {
    catalog: &'a Catalog,
    dialect: Dialect,
    entity: String,
    fields: FieldPolicy,
    lookups: Option<BTreeSet<String>>,
    subqueries: BTreeMap<String, Vec<String>>,
    quick_fields: Vec<String>,
    today: NaiveDate,
}

impl<'a> FilterCompiler<'a> {
    /// A compiler with no restrictions beyond the catalog.
    pub fn new(catalog: &'a Catalog, dialect: Dialect, entity: &str) -> Self {
        Self {
            catalog,
            dialect,
            entity: entity.to_string(),
            fields: FieldPolicy::Any,
            lookups: None,
            subqueries: BTreeMap::new(),
            quick_fields: Vec::new(),
            today: Local::now().date_naive(),
        }
    }

    /// A compiler enforcing the dataset's field, lookup and subquery policy.
    pub fn for_dataset(catalog: &'a Catalog, dialect: Dialect, dataset: &DatasetDefinition) -> Self {
        let policy = &dataset.metadata;
        Self::new(catalog, dialect, &dataset.source)
            .with_field_policy(FieldPolicy::for_dataset(dataset))
            .with_allowed_lookups(policy.allowed_lookups.clone())
            .with_subqueries(policy.allowed_subqueries.clone())
            .with_quick_search_fields(policy.quick_search_fields.clone())
    }

    pub fn with_field_policy(mut self, fields: FieldPolicy) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_allowed_lookups(mut self, lookups: Option<Vec<String>>) -> Self {
        self.lookups = lookups.map(|l| l.into_iter().map(|s| s.to_ascii_lowercase()).collect());
        self
    }

    pub fn with_subqueries(mut self, subqueries: BTreeMap<String, Vec<String>>) -> Self {
        self.subqueries = subqueries;
        self
    }

    pub fn with_quick_search_fields(mut self, fields: Vec<String>) -> Self {
        self.quick_fields = fields;
        self
    }

    /// Fix the date temporal shortcuts are resolved against.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Compile against the source entity aliased `t0`, returning the joins
    /// the predicate needs.
    pub fn compile(&self, node: &FilterNode) -> CompiledFilter {
        let mut planner = JoinPlanner::new("t");
        let mut compiled = self.compile_with(node, &mut planner);
        compiled.joins = planner.into_joins();
        compiled
    }

    /// Compile into a planner shared with the rest of the query.
    pub fn compile_with(&self, node: &FilterNode, planner: &mut JoinPlanner) -> CompiledFilter {
        let mut st = CompileState::default();
        let scope = Scope {
            entity: self.entity.clone(),
            alias: planner.root_alias(),
            prefix: String::new(),
            fields: ScopeFields::Policy,
        };

        let predicate = fold_tree(node, &mut |spec| {
            let expr = self.leaf(&mut st, &scope, planner, spec)?;
            st.specs.push(spec.clone());
            Some(expr)
        });

        debug!(
            entity = %self.entity,
            clauses = st.specs.len(),
            dropped = st.warnings.len(),
            "compiled filter"
        );
        CompiledFilter {
            predicate,
            specs: st.specs,
            warnings: st.warnings,
            joins: Vec::new(),
        }
    }

    /// Compile a HAVING tree. Fields name output aliases, which map to the
    /// aggregate expressions in `aliases`; only plain comparisons apply.
    pub fn compile_having(&self, node: &FilterNode, aliases: &BTreeMap<String, Expr>) -> CompiledFilter {
        let mut st = CompileState::default();
        let predicate = fold_tree(node, &mut |spec| match self.having_leaf(spec, aliases) {
            Ok(expr) => {
                st.specs.push(spec.clone());
                Some(expr)
            }
            Err(message) => {
                st.warn(message);
                None
            }
        });
        CompiledFilter {
            predicate,
            specs: st.specs,
            warnings: st.warnings,
            joins: Vec::new(),
        }
    }

    /// Case-insensitive substring match of `term` over the quick-search fields.
    pub fn quick_search(&self, term: &str, planner: &mut JoinPlanner) -> CompiledFilter {
        let mut st = CompileState::default();
        let term = term.trim();
        if term.is_empty() {
            return CompiledFilter::default();
        }
        if self.quick_fields.is_empty() {
            st.warn("Quick search is not configured for this dataset".to_string());
        }

        let value = Value::String(term.to_string());
        let root = planner.root_alias();
        let mut matches = Vec::new();
        for field in &self.quick_fields {
            let result = self
                .catalog
                .resolve(&self.entity, field)
                .map_err(|e| e.to_string())
                .and_then(|resolved| {
                    let PathTarget::Column { column, .. } = &resolved.target else {
                        return Err("not a column".to_string());
                    };
                    self.through_hops(&mut st, planner, &root, &resolved.hops, |this, _, _, alias| {
                        lookup::apply(this.dialect, table_col(alias, column), Comparison::IContains, &value)
                    })
                });
            match result {
                Ok(expr) => matches.push(expr),
                Err(message) => st.warn(format!("Quick search field '{}' ignored: {}", field, message)),
            }
        }

        CompiledFilter {
            predicate: or_all(matches),
            specs: Vec::new(),
            warnings: st.warnings,
            joins: Vec::new(),
        }
    }

    fn lookup_allowed(&self, lookup: &Lookup) -> bool {
        match &self.lookups {
            None => true,
            Some(allowed) => lookup.policy_names().iter().all(|n| allowed.contains(*n)),
        }
    }

    fn field_allowed(&self, scope: &Scope, field: &str, relation: bool) -> bool {
        let path = format!("{}{}", scope.prefix, field);
        match &scope.fields {
            ScopeFields::Listed(fields) => fields.iter().any(|f| *f == path),
            ScopeFields::Policy if relation => self.fields.allows_relation(&path),
            ScopeFields::Policy => self.fields.allows(&path),
        }
    }

    fn leaf(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        planner: &mut JoinPlanner,
        spec: &FilterSpec,
    ) -> Option<Expr> {
        let path = format!("{}{}", scope.prefix, spec.field);
        let Some(lookup) = Lookup::parse(&spec.lookup) else {
            st.warn(format!("Unsupported lookup '{}' on '{}'", spec.lookup, path));
            return None;
        };
        if !self.lookup_allowed(&lookup) {
            st.warn(format!("Lookup '{}' is not allowed for this dataset", spec.lookup));
            return None;
        }
        if !self.field_allowed(scope, &spec.field, lookup.targets_relation()) {
            st.warn(format!("Filtering on '{}' is not allowed", path));
            return None;
        }
        let resolved = match self.catalog.resolve(&scope.entity, &spec.field) {
            Ok(resolved) => resolved,
            Err(e) => {
                st.warn(format!("Ignoring filter on '{}': {}", path, e));
                return None;
            }
        };

        let result = match lookup {
            Lookup::Quantifier(q) => self.quantifier(st, scope, planner, spec, &resolved, q),
            Lookup::Count(op) => self.count(st, scope, planner, spec, &resolved, op),
            Lookup::Window => self.window(st, scope, spec, &resolved),
            Lookup::Was => self.was(st, scope, spec, &resolved),
            Lookup::InSubquery => self.in_subquery(st, scope, planner, spec, &resolved),
            Lookup::Compare { .. } | Lookup::Temporal(_) => {
                self.comparison(st, scope, planner, spec, &resolved, lookup)
            }
        };

        match result {
            Ok(expr) => Some(expr),
            Err(message) => {
                st.warn(format!(
                    "Ignoring filter on '{}' ({}): {}",
                    path, spec.lookup, message
                ));
                None
            }
        }
    }

    /// Walk `hops` from `base_alias` and call `f` with the alias of the last
    /// entity. Everything after the first to-many hop moves into a
    /// correlated `EXISTS`.
    fn through_hops<F>(
        &self,
        st: &mut CompileState,
        planner: &mut JoinPlanner,
        base_alias: &str,
        hops: &[Hop],
        f: F,
    ) -> Result<Expr, String>
    where
        F: FnOnce(&Self, &mut CompileState, &mut JoinPlanner, &str) -> Result<Expr, String>,
    {
        match hops.iter().position(|h| h.relation.kind == RelationKind::ToMany) {
            None => {
                let alias = planner.join_hops(base_alias, hops);
                f(self, st, planner, &alias)
            }
            Some(i) => {
                let owner = planner.join_hops(base_alias, &hops[..i]);
                let alias = st.next_alias();
                let mut inner = JoinPlanner::new(&format!("{}_", alias));
                let condition = self.through_hops(st, &mut inner, &alias, &hops[i + 1..], f)?;
                let mut query = correlated(&hops[i], &owner, &alias);
                query.joins = inner.into_joins();
                Ok(exists(query.filter(condition)))
            }
        }
    }

    fn compare(&self, target: Expr, lookup: Lookup, value: &Value) -> Result<Expr, String> {
        match lookup {
            Lookup::Temporal(shortcut) => {
                let range = temporal::resolve(shortcut, value, self.today)?;
                let within = target
                    .clone()
                    .gte(lit_date(&range.start.to_string()))
                    .and(target.lt(lit_date(&range.end.to_string())));
                Ok(if range.negated { within.not() } else { within })
            }
            Lookup::Compare { transform, op } => {
                let target = match transform {
                    Some(t) => t.apply(self.dialect, target),
                    None => target,
                };
                lookup::apply(self.dialect, target, op, value)
            }
            _ => Err("not a comparison lookup".to_string()),
        }
    }

    fn comparison(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        planner: &mut JoinPlanner,
        spec: &FilterSpec,
        resolved: &ResolvedPath,
        lookup: Lookup,
    ) -> Result<Expr, String> {
        let PathTarget::Column { column, .. } = &resolved.target else {
            return Err("field is a to-many relation; use some, every, none or count".to_string());
        };
        self.through_hops(st, planner, &scope.alias, &resolved.hops, |this, _, _, alias| {
            this.compare(table_col(alias, column), lookup, &spec.value)
        })
    }

    /// `SELECT 1 FROM related WHERE <correlation>` plus the compiled nested
    /// condition, which is scoped to the related entity.
    fn related_subquery(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        spec: &FilterSpec,
        hop: &Hop,
        owner_alias: &str,
        entity: &str,
    ) -> (Query, Option<Expr>) {
        let alias = st.next_alias();
        let mut inner = JoinPlanner::new(&format!("{}_", alias));
        let nested_scope = Scope {
            entity: entity.to_string(),
            alias: alias.clone(),
            prefix: format!("{}{}__", scope.prefix, spec.field),
            fields: scope.fields.clone(),
        };
        let condition = spec.nested.as_deref().and_then(|node| {
            fold_tree(node, &mut |nested| {
                self.leaf(st, &nested_scope, &mut inner, nested)
            })
        });

        let mut query = correlated(hop, owner_alias, &alias);
        query.joins = inner.into_joins();
        (query, condition)
    }

    fn quantifier(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        planner: &mut JoinPlanner,
        spec: &FilterSpec,
        resolved: &ResolvedPath,
        quantifier: Quantifier,
    ) -> Result<Expr, String> {
        let (hop, prefix, entity) = relation_hops(resolved)?;
        self.through_hops(st, planner, &scope.alias, prefix, |this, st, _, owner| {
            let (query, condition) = this.related_subquery(st, scope, spec, hop, owner, entity);
            match quantifier {
                Quantifier::Some => Ok(exists(with_condition(query, condition))),
                Quantifier::None => Ok(not_exists(with_condition(query, condition))),
                Quantifier::Every => {
                    let condition = condition
                        .ok_or_else(|| "every needs a condition on the related rows".to_string())?;
                    let failing = case_when(condition, lit_int(1), Some(lit_int(0))).eq(lit_int(0));
                    Ok(not_exists(query.filter(failing)))
                }
            }
        })
    }

    fn count(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        planner: &mut JoinPlanner,
        spec: &FilterSpec,
        resolved: &ResolvedPath,
        op: Comparison,
    ) -> Result<Expr, String> {
        let (hop, prefix, entity) = relation_hops(resolved)?;
        let bounds = count_bounds(op, &spec.value)?;
        self.through_hops(st, planner, &scope.alias, prefix, |this, st, _, owner| {
            let (query, condition) = this.related_subquery(st, scope, spec, hop, owner, entity);
            let counted = Expr::Subquery(Box::new(
                with_condition(query, condition).select(vec![count_star()]),
            ));
            let parts = bounds
                .iter()
                .map(|(op, n)| lookup::apply(this.dialect, counted.clone(), *op, &Value::from(*n)))
                .collect::<Result<Vec<_>, _>>()?;
            and_all(parts).ok_or_else(|| "count needs a bound".to_string())
        })
    }

    fn window(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        spec: &FilterSpec,
        resolved: &ResolvedPath,
    ) -> Result<Expr, String> {
        let column = direct_column(resolved)?;
        let Value::Object(options) = &spec.value else {
            return Err("window expects an object".to_string());
        };
        let entity = self.catalog.entity(&scope.entity).map_err(|e| e.to_string())?;

        let function = match options.get("function").and_then(Value::as_str).unwrap_or("row_number") {
            "row_number" => row_number(),
            "rank" => rank(),
            "dense_rank" => dense_rank(),
            other => return Err(format!("unknown window function '{}'", other)),
        };
        let ascending = options.get("order").and_then(Value::as_str) == Some("asc");

        let alias = st.next_alias();
        let mut partition = Vec::new();
        let partition_fields: Vec<&str> = match options.get("partition_by") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(field)) => vec![field.as_str()],
            Some(Value::Array(fields)) => fields.iter().filter_map(Value::as_str).collect(),
            Some(_) => return Err("partition_by expects a field or a list of fields".to_string()),
        };
        for field in partition_fields {
            if !self.field_allowed(scope, field, false) {
                return Err(format!("partitioning on '{}' is not allowed", field));
            }
            let path = self.catalog.resolve(&scope.entity, field).map_err(|e| e.to_string())?;
            partition.push(table_col(&alias, direct_column(&path)?));
        }

        let order = table_col(&alias, column);
        let order = if ascending {
            WindowOrderBy::asc(order)
        } else {
            WindowOrderBy::desc(order)
        };
        let ranked = Query::new()
            .select(vec![
                SelectExpr::from(table_col(&alias, &entity.primary_key)),
                function.over(partition, vec![order]).alias("window_rank"),
            ])
            .from(entity_table(entity, &alias));

        let outer_alias = format!("{}_r", alias);
        let rank_col = table_col(&outer_alias, "window_rank");
        let mut bounds = Vec::new();
        for (key, bound) in options {
            let op = match key.as_str() {
                "top" => Comparison::Lte,
                key => match Comparison::parse(key) {
                    Some(op @ (Comparison::Exact | Comparison::Lt | Comparison::Lte | Comparison::Gt | Comparison::Gte)) => op,
                    _ => continue,
                },
            };
            let n = bound
                .as_i64()
                .ok_or_else(|| format!("window bound '{}' must be an integer", key))?;
            bounds.push(lookup::apply(self.dialect, rank_col.clone(), op, &Value::from(n))?);
        }
        let bound = and_all(bounds).ok_or_else(|| "window needs a rank bound such as lte".to_string())?;

        let kept = Query::new()
            .select(vec![table_col(&outer_alias, &entity.primary_key)])
            .from(TableRef::derived(ranked, &outer_alias))
            .filter(bound);
        Ok(table_col(&scope.alias, &entity.primary_key).in_subquery(kept))
    }

    fn was(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        spec: &FilterSpec,
        resolved: &ResolvedPath,
    ) -> Result<Expr, String> {
        let column = direct_column(resolved)?;
        let entity = self.catalog.entity(&scope.entity).map_err(|e| e.to_string())?;
        let history = entity
            .history
            .as_ref()
            .ok_or_else(|| format!("'{}' has no history table", scope.entity))?;

        let (value, since, until) = match &spec.value {
            Value::Object(options) => (
                options.get("value").cloned().unwrap_or(Value::Null),
                options.get("since"),
                options.get("until"),
            ),
            other => (other.clone(), None, None),
        };
        let op = if value.is_array() {
            Comparison::In
        } else {
            Comparison::Exact
        };

        let alias = st.next_alias();
        let mut table = TableRef::new(&history.table).with_alias(&alias);
        if let Some(schema) = &entity.schema {
            table = table.with_schema(schema);
        }
        let mut query = Query::new()
            .select(vec![lit_int(1)])
            .from(table)
            .filter(
                table_col(&alias, &history.key_column)
                    .eq(table_col(&scope.alias, &entity.primary_key)),
            )
            .filter(lookup::apply(self.dialect, table_col(&alias, column), op, &value)?);
        if let Some(since) = since {
            query = query.filter(table_col(&alias, &history.timestamp_column).gte(lookup::literal(since)?));
        }
        if let Some(until) = until {
            query = query.filter(table_col(&alias, &history.timestamp_column).lt(lookup::literal(until)?));
        }
        Ok(exists(query))
    }

    fn in_subquery(
        &self,
        st: &mut CompileState,
        scope: &Scope,
        planner: &mut JoinPlanner,
        spec: &FilterSpec,
        resolved: &ResolvedPath,
    ) -> Result<Expr, String> {
        let PathTarget::Column { column, .. } = &resolved.target else {
            return Err("in_subquery needs a column".to_string());
        };
        let Value::Object(options) = &spec.value else {
            return Err("in_subquery expects {entity, field, filter}".to_string());
        };
        let entity_name = options
            .get("entity")
            .and_then(Value::as_str)
            .ok_or_else(|| "in_subquery needs an entity".to_string())?;
        let field = options
            .get("field")
            .and_then(Value::as_str)
            .ok_or_else(|| "in_subquery needs a field".to_string())?;
        let allowed = self
            .subqueries
            .get(entity_name)
            .ok_or_else(|| format!("subqueries on '{}' are not allowed", entity_name))?;
        if !allowed.iter().any(|f| f == field) {
            return Err(format!("'{}.{}' is not allowed in subqueries", entity_name, field));
        }

        let entity = self.catalog.entity(entity_name).map_err(|e| e.to_string())?;
        let projected = self.catalog.resolve(entity_name, field).map_err(|e| e.to_string())?;
        let PathTarget::Column { column: projected_column, .. } = &projected.target else {
            return Err(format!("'{}' is not a column", field));
        };
        if projected.first_to_many().is_some() {
            return Err(format!("'{}' crosses a to-many relation", field));
        }

        let alias = st.next_alias();
        let mut inner = JoinPlanner::new(&format!("{}_", alias));
        let projected_alias = inner.join_hops(&alias, &projected.hops);
        let sub_scope = Scope {
            entity: entity_name.to_string(),
            alias: alias.clone(),
            prefix: String::new(),
            fields: ScopeFields::Listed(allowed.clone()),
        };
        let condition = spec.nested.as_deref().and_then(|node| {
            fold_tree(node, &mut |nested| self.leaf(st, &sub_scope, &mut inner, nested))
        });

        let mut query = Query::new()
            .select(vec![table_col(&projected_alias, projected_column)])
            .from(entity_table(entity, &alias));
        query.joins = inner.into_joins();
        let query = with_condition(query, condition);

        self.through_hops(st, planner, &scope.alias, &resolved.hops, |_, _, _, owner| {
            Ok(table_col(owner, column).in_subquery(query))
        })
    }

    fn having_leaf(&self, spec: &FilterSpec, aliases: &BTreeMap<String, Expr>) -> Result<Expr, String> {
        let expr = aliases
            .get(&spec.field)
            .ok_or_else(|| format!("HAVING on '{}' ignored: not an output alias", spec.field))?;
        let lookup = Lookup::parse(&spec.lookup)
            .ok_or_else(|| format!("Unsupported lookup '{}' on '{}'", spec.lookup, spec.field))?;
        if !self.lookup_allowed(&lookup) {
            return Err(format!("Lookup '{}' is not allowed for this dataset", spec.lookup));
        }
        match lookup {
            Lookup::Compare { transform: None, op } if op.is_ordering() => {
                lookup::apply(self.dialect, expr.clone(), op, &spec.value)
                    .map_err(|e| format!("HAVING on '{}' ignored: {}", spec.field, e))
            }
            _ => Err(format!("Lookup '{}' is not supported in HAVING", spec.lookup)),
        }
    }
}

fn with_condition(query: Query, condition: Option<Expr>) -> Query {
    match condition {
        Some(condition) => query.filter(condition),
        None => query,
    }
}

/// Split a path ending on a to-many relation into (that hop, the hops
/// before it, the related entity).
fn relation_hops(resolved: &ResolvedPath) -> Result<(&Hop, &[Hop], &str), String> {
    match (&resolved.target, resolved.hops.split_last()) {
        (PathTarget::Relation { entity }, Some((last, prefix))) => Ok((last, prefix, entity.as_str())),
        _ => Err("field is not a to-many relation".to_string()),
    }
}

fn direct_column(resolved: &ResolvedPath) -> Result<&str, String> {
    match &resolved.target {
        PathTarget::Column { column, .. } if resolved.hops.is_empty() => Ok(column),
        _ => Err("only columns of the entity itself are supported here".to_string()),
    }
}

/// Count bounds: a bare integer compared with the lookup's operator, or an
/// object of `{op: n}` pairs next to the optional `filter` key.
fn count_bounds(op: Comparison, value: &Value) -> Result<Vec<(Comparison, i64)>, String> {
    let countable = |op: Comparison| {
        matches!(
            op,
            Comparison::Exact
                | Comparison::Ne
                | Comparison::Gt
                | Comparison::Gte
                | Comparison::Lt
                | Comparison::Lte
        )
    };
    if !countable(op) {
        return Err(format!("count does not support '{}'", op.as_str()));
    }

    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|n| vec![(op, n)])
            .ok_or_else(|| "count expects an integer".to_string()),
        Value::Object(options) => {
            let mut bounds = Vec::new();
            for (key, bound) in options {
                let op = match key.as_str() {
                    "filter" => continue,
                    "value" => op,
                    key => Comparison::parse(key)
                        .filter(|op| countable(*op))
                        .ok_or_else(|| format!("unsupported count comparison '{}'", key))?,
                };
                let n = bound
                    .as_i64()
                    .ok_or_else(|| format!("count bound '{}' must be an integer", key))?;
                bounds.push((op, n));
            }
            if bounds.is_empty() {
                return Err("count needs a bound".to_string());
            }
            Ok(bounds)
        }
        _ => Err("count expects an integer or an object of bounds".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::catalog::tests::shop;
    use serde_json::json;

    fn tree(value: Value) -> FilterNode {
        let mut warnings = Vec::new();
        let node = FilterNode::parse(&value, &mut warnings);
        assert!(warnings.is_empty(), "{:?}", warnings);
        node
    }

    fn sql(compiled: &CompiledFilter) -> String {
        compiled
            .predicate
            .as_ref()
            .map(|p| p.to_sql(Dialect::Sqlite))
            .unwrap_or_default()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_simple_and_joined_fields() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let compiled = compiler.compile(&tree(json!({"status": "paid", "customer__region": "EU"})));

        assert_eq!(
            sql(&compiled),
            "\"t1\".\"region\" = 'EU' AND \"t0\".\"status\" = 'paid'"
        );
        assert_eq!(compiled.specs.len(), 2);
        assert_eq!(compiled.joins.len(), 1);
    }

    #[test]
    fn test_disallowed_field_is_dropped() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders")
            .with_field_policy(FieldPolicy::Listed(["status".to_string()].into()));
        let compiled = compiler.compile(&tree(json!({"status": "paid", "amount": {"gt": 5}})));

        assert_eq!(sql(&compiled), "\"t0\".\"status\" = 'paid'");
        assert_eq!(compiled.warnings, vec!["Filtering on 'amount' is not allowed"]);
    }

    #[test]
    fn test_disallowed_lookup_is_dropped() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders")
            .with_allowed_lookups(Some(vec!["exact".to_string()]));
        let compiled = compiler.compile(&tree(json!({"status": {"icontains": "pa"}})));
        assert!(compiled.predicate.is_none());
        assert_eq!(compiled.warnings.len(), 1);
    }

    #[test]
    fn test_to_many_path_becomes_exists() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let compiled = compiler.compile(&tree(json!({"lines__sku": "A-1"})));

        assert!(compiled.joins.is_empty());
        assert_eq!(
            sql(&compiled),
            "EXISTS (SELECT\n  1\nFROM \"order_lines\" AS \"s1\"\nWHERE \"s1\".\"order_id\" = \"t0\".\"id\" AND \"s1\".\"sku\" = 'A-1')"
        );
    }

    #[test]
    fn test_quantifiers() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");

        let some = sql(&compiler.compile(&tree(json!({"lines": {"some": {"quantity": {"gt": 2}}}}))));
        assert!(some.starts_with("EXISTS (SELECT"));
        assert!(some.contains("\"s1\".\"quantity\" > 2"));

        let none = sql(&compiler.compile(&tree(json!({"lines": {"none": {"sku": "X"}}}))));
        assert!(none.starts_with("NOT EXISTS (SELECT"));

        let every = sql(&compiler.compile(&tree(json!({"lines": {"every": {"quantity": {"gte": 1}}}}))));
        assert!(every.starts_with("NOT EXISTS (SELECT"));
        assert!(every.contains("CASE WHEN \"s1\".\"quantity\" >= 1 THEN 1 ELSE 0 END = 0"));
    }

    #[test]
    fn test_count_with_nested_filter() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let compiled = compiler.compile(&tree(json!({
            "lines": {"count": {"gte": 2, "filter": {"quantity": {"gt": 1}}}}
        })));
        let sql = sql(&compiled);

        assert!(sql.starts_with("(SELECT\n  COUNT(*)"), "{}", sql);
        assert!(sql.contains("\"s1\".\"quantity\" > 1"));
        assert!(sql.ends_with(") >= 2"));
    }

    #[test]
    fn test_nested_fields_use_relation_prefix_for_allowlist() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders")
            .with_field_policy(FieldPolicy::Listed(["lines__sku".to_string()].into()));

        let ok = compiler.compile(&tree(json!({"lines": {"some": {"sku": "A"}}})));
        assert!(ok.warnings.is_empty(), "{:?}", ok.warnings);

        let denied = compiler.compile(&tree(json!({"lines": {"some": {"quantity": 1}}})));
        assert_eq!(denied.warnings, vec!["Filtering on 'lines__quantity' is not allowed"]);
        // The quantifier itself still applies, without a condition.
        assert!(sql(&denied).starts_with("EXISTS"));
    }

    #[test]
    fn test_temporal_shortcut_uses_today() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders").with_today(day(2024, 3, 14));
        let compiled = compiler.compile(&tree(json!({"created": {"this_month": true}})));
        assert_eq!(
            sql(&compiled),
            "\"t0\".\"created\" >= '2024-03-01' AND \"t0\".\"created\" < '2024-04-01'"
        );

        let outside = compiler.compile(&tree(json!({"created": {"today": false}})));
        assert!(sql(&outside).starts_with("NOT ("));
    }

    #[test]
    fn test_negate_and_not() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let compiled = compiler.compile(&tree(json!([
            {"field": "status", "value": "void", "negate": true}
        ])));
        assert_eq!(sql(&compiled), "NOT (\"t0\".\"status\" = 'void')");
    }

    #[test]
    fn test_was_requires_history() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let compiled = compiler.compile(&tree(json!({
            "status": {"was": {"value": "pending", "since": "2024-01-01"}}
        })));
        let sql = sql(&compiled);
        assert!(sql.contains("FROM \"order_history\" AS \"s1\""), "{}", sql);
        assert!(sql.contains("\"s1\".\"order_id\" = \"t0\".\"id\""));
        assert!(sql.contains("\"s1\".\"changed_at\" >= '2024-01-01'"));

        let customers = FilterCompiler::new(&catalog, Dialect::Sqlite, "customers");
        let compiled = customers.compile(&tree(json!({"name": {"was": "Ann"}})));
        assert!(compiled.predicate.is_none());
        assert_eq!(compiled.warnings.len(), 1);
    }

    #[test]
    fn test_window_ranks_within_partition() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let compiled = compiler.compile(&tree(json!({
            "amount": {"window": {"partition_by": "customer_id", "lte": 1}}
        })));
        let sql = sql(&compiled);
        assert!(sql.starts_with("\"t0\".\"id\" IN (SELECT"), "{}", sql);
        assert!(sql.contains("ROW_NUMBER() OVER (PARTITION BY \"s1\".\"customer_id\" ORDER BY \"s1\".\"amount\" DESC)"));
        assert!(sql.contains("\"s1_r\".\"window_rank\" <= 1"));
    }

    #[test]
    fn test_in_subquery_respects_allowlist() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders").with_subqueries(
            [("customers".to_string(), vec!["id".to_string(), "region".to_string()])].into(),
        );

        let compiled = compiler.compile(&tree(json!({
            "customer_id": {"in_subquery": {"entity": "customers", "field": "id", "filter": {"region": "EU"}}}
        })));
        let sql = sql(&compiled);
        assert!(sql.starts_with("\"t0\".\"customer_id\" IN (SELECT"), "{}", sql);
        assert!(sql.contains("\"s1\".\"region\" = 'EU'"));

        let denied = compiler.compile(&tree(json!({
            "customer_id": {"in_subquery": {"entity": "customers", "field": "id", "filter": {"name": "x"}}}
        })));
        assert_eq!(denied.warnings, vec!["Filtering on 'name' is not allowed"]);

        let other = compiler.compile(&tree(json!({
            "id": {"in_subquery": {"entity": "order_lines", "field": "order_id"}}
        })));
        assert!(other.predicate.is_none());
    }

    #[test]
    fn test_having_only_on_aliases() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders");
        let aliases: BTreeMap<String, Expr> =
            [("total".to_string(), crate::sql::expr::sum(table_col("t0", "amount")))].into();

        let compiled = compiler.compile_having(
            &tree(json!({"total": {"gt": 100}, "status": "paid"})),
            &aliases,
        );
        assert_eq!(sql(&compiled), "SUM(\"t0\".\"amount\") > 100");
        assert_eq!(compiled.warnings.len(), 1);
    }

    #[test]
    fn test_quick_search_ors_fields() {
        let catalog = shop();
        let compiler = FilterCompiler::new(&catalog, Dialect::Sqlite, "orders")
            .with_quick_search_fields(vec!["status".to_string(), "customer__name".to_string()]);
        let mut planner = JoinPlanner::new("t");
        let compiled = compiler.quick_search("Ann", &mut planner);
        assert_eq!(
            sql(&compiled),
            "LOWER(\"t0\".\"status\") LIKE '%ann%' ESCAPE '\\' OR LOWER(\"t1\".\"name\") LIKE '%ann%' ESCAPE '\\'"
        );
        assert_eq!(planner.joins().len(), 1);
    }

    #[test]
    fn test_field_policy_for_dataset() {
        let dataset: DatasetDefinition = serde_json::from_value(json!({
            "code": "orders",
            "source": "orders",
            "dimensions": [{"field": "status"}],
            "metrics": [{"field": "amount", "aggregation": "sum"}],
            "metadata": {"quick_search_fields": ["customer__name"]}
        }))
        .unwrap();
        let policy = FieldPolicy::for_dataset(&dataset);
        assert!(policy.allows("status"));
        assert!(policy.allows("customer__name"));
        assert!(policy.allows_relation("customer"));
        assert!(!policy.allows("created"));

        let open: DatasetDefinition = serde_json::from_value(json!({
            "code": "o", "source": "orders", "metadata": {"allow_ad_hoc": true}
        }))
        .unwrap();
        assert_eq!(FieldPolicy::for_dataset(&open), FieldPolicy::Any);
    }
}
