//! LEFT JOIN planning for related field paths.
//!
//! Each distinct relation path is joined once per query and gets an alias
//! derived from the planner prefix (`t1`, `t2`, ...; `t0` is the root).

use std::collections::BTreeMap;

use crate::model::{EntitySchema, Hop, RelationKind};
use crate::sql::expr::{lit_int, table_col, ExprExt};
use crate::sql::query::{Join, JoinType, Query, TableRef};

#[derive(Debug, Clone)]
pub struct JoinPlanner {
    prefix: String,
    next: usize,
    aliases: BTreeMap<(String, String), String>,
    joins: Vec<Join>,
}

impl JoinPlanner {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 1,
            aliases: BTreeMap::new(),
            joins: Vec::new(),
        }
    }

    pub fn root_alias(&self) -> String {
        format!("{}0", self.prefix)
    }

    /// Join every hop starting from `base_alias`; returns the alias of the
    /// last joined entity.
    pub fn join_hops(&mut self, base_alias: &str, hops: &[Hop]) -> String {
        let mut current = base_alias.to_string();
        for hop in hops {
            let key = (base_alias.to_string(), hop.path.clone());
            if let Some(alias) = self.aliases.get(&key) {
                current = alias.clone();
                continue;
            }

            let alias = format!("{}{}", self.prefix, self.next);
            self.next += 1;
            let on = table_col(&current, &hop.relation.local_column)
                .eq(table_col(&alias, &hop.relation.remote_column));
            self.joins.push(Join {
                join_type: JoinType::Left,
                table: table_ref(hop, &alias),
                on,
            });
            self.aliases.insert(key, alias.clone());
            current = alias;
        }
        current
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn into_joins(self) -> Vec<Join> {
        self.joins
    }
}

/// `FROM` item for an entity's table.
pub(crate) fn entity_table(entity: &EntitySchema, alias: &str) -> TableRef {
    let table = TableRef::new(&entity.table).with_alias(alias);
    match &entity.schema {
        Some(schema) => table.with_schema(schema),
        None => table,
    }
}

pub(crate) fn table_ref(hop: &Hop, alias: &str) -> TableRef {
    let table = TableRef::new(&hop.target_table).with_alias(alias);
    match &hop.target_schema {
        Some(schema) => table.with_schema(schema),
        None => table,
    }
}

/// `SELECT 1 FROM <related> AS alias WHERE alias.fk = owner.key`
pub(crate) fn correlated(hop: &Hop, owner_alias: &str, alias: &str) -> Query {
    debug_assert_eq!(hop.relation.kind, RelationKind::ToMany);
    Query::new()
        .select(vec![lit_int(1)])
        .from(table_ref(hop, alias))
        .filter(
            table_col(alias, &hop.relation.remote_column)
                .eq(table_col(owner_alias, &hop.relation.local_column)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::catalog::tests::shop;
    use crate::sql::dialect::Dialect;

    #[test]
    fn test_same_path_joined_once() {
        let catalog = shop();
        let region = catalog.resolve("orders", "customer__region").unwrap();
        let name = catalog.resolve("orders", "customer__name").unwrap();

        let mut planner = JoinPlanner::new("t");
        let root = planner.root_alias();
        assert_eq!(planner.join_hops(&root, &region.hops), "t1");
        assert_eq!(planner.join_hops(&root, &name.hops), "t1");
        assert_eq!(planner.joins().len(), 1);
        assert_eq!(
            planner.joins()[0].to_tokens(Dialect::Sqlite).serialize(Dialect::Sqlite),
            "LEFT JOIN \"customers\" AS \"t1\" ON \"t0\".\"customer_id\" = \"t1\".\"id\""
        );
    }
}
