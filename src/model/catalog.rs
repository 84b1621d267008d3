//! Source entity introspection.
//!
//! A [`Catalog`] describes the relational model the engine queries: one
//! [`EntitySchema`] per entity with typed fields, to-one/to-many relations
//! and an optional history table. Field paths use `__` to traverse
//! relations (`customer__region`), and [`Catalog::resolve`] turns a path
//! into the hops and column it denotes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Invalid field path '{path}': '{segment}' is not a field or relation of '{entity}'")]
    UnknownField {
        path: String,
        entity: String,
        segment: String,
    },

    #[error("Invalid field path '{path}': '{segment}' is a field and cannot be traversed")]
    NotARelation { path: String, segment: String },

    #[error("Invalid field path '{0}'")]
    EmptyPath(String),

    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Column types, used to pick literal and date handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    Decimal,
    #[default]
    String,
    Bool,
    Date,
    #[serde(alias = "timestamp")]
    DateTime,
    Uuid,
    Json,
}

impl FieldType {
    pub fn is_temporal(self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float | FieldType::Decimal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    ToOne,
    ToMany,
}

/// A relation from one entity to another.
///
/// For `to_one`, `local_column` is the foreign key on this entity and
/// `remote_column` the key it points at. For `to_many`, `remote_column` is
/// the foreign key on the related entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub entity: String,
    pub kind: RelationKind,
    pub local_column: String,
    pub remote_column: String,
}

/// Table holding past values of an entity's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTable {
    pub table: String,
    /// Column referencing the entity's primary key.
    pub key_column: String,
    pub timestamp_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
    #[serde(default)]
    pub history: Option<HistoryTable>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl EntitySchema {
    pub fn field_type(&self, column: &str) -> Option<FieldType> {
        self.fields.get(column).copied().or_else(|| {
            (column == self.primary_key).then_some(FieldType::Int)
        })
    }
}

/// One relation traversal in a resolved path.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    /// Path prefix up to and including this relation (`customer__region`).
    pub path: String,
    pub relation: Relation,
    pub target_table: String,
    pub target_schema: Option<String>,
}

/// What a field path ends on.
#[derive(Debug, Clone, PartialEq)]
pub enum PathTarget {
    Column {
        column: String,
        field_type: FieldType,
        /// Entity owning the column.
        entity: String,
    },
    /// The path ends on a to-many relation; the last hop is that relation.
    Relation { entity: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub hops: Vec<Hop>,
    pub target: PathTarget,
}

impl ResolvedPath {
    /// Index of the first to-many hop, if any.
    pub fn first_to_many(&self) -> Option<usize> {
        self.hops
            .iter()
            .position(|h| h.relation.kind == RelationKind::ToMany)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub entities: BTreeMap<String, EntitySchema>,
}

impl Catalog {
    pub fn from_toml_str(s: &str) -> CatalogResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> CatalogResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a `.json` or `.toml` file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CatalogResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn entity(&self, name: &str) -> CatalogResult<&EntitySchema> {
        self.entities
            .get(name)
            .ok_or_else(|| CatalogError::UnknownEntity(name.to_string()))
    }

    /// Resolve a `__`-separated field path starting at `entity`.
    ///
    /// A trailing to-one relation resolves to its foreign key column; a
    /// trailing to-many relation resolves to [`PathTarget::Relation`].
    /// `pk` names the primary key of the current entity.
    pub fn resolve(&self, entity: &str, path: &str) -> CatalogResult<ResolvedPath> {
        if path.is_empty() || path.split("__").any(str::is_empty) {
            return Err(CatalogError::EmptyPath(path.to_string()));
        }

        let segments: Vec<&str> = path.split("__").collect();
        let mut current_name = entity.to_string();
        let mut current = self.entity(entity)?;
        let mut hops = Vec::new();

        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();

            if last {
                if *segment == "pk" {
                    return Ok(ResolvedPath {
                        hops,
                        target: PathTarget::Column {
                            column: current.primary_key.clone(),
                            field_type: current
                                .field_type(&current.primary_key)
                                .unwrap_or(FieldType::Int),
                            entity: current_name,
                        },
                    });
                }
                if let Some(field_type) = current.field_type(segment) {
                    return Ok(ResolvedPath {
                        hops,
                        target: PathTarget::Column {
                            column: segment.to_string(),
                            field_type,
                            entity: current_name,
                        },
                    });
                }
            }

            let Some(relation) = current.relations.get(*segment) else {
                if current.field_type(segment).is_some() {
                    return Err(CatalogError::NotARelation {
                        path: path.to_string(),
                        segment: segment.to_string(),
                    });
                }
                return Err(CatalogError::UnknownField {
                    path: path.to_string(),
                    entity: current_name,
                    segment: segment.to_string(),
                });
            };

            if last && relation.kind == RelationKind::ToOne {
                let field_type = current
                    .field_type(&relation.local_column)
                    .unwrap_or(FieldType::Int);
                return Ok(ResolvedPath {
                    hops,
                    target: PathTarget::Column {
                        column: relation.local_column.clone(),
                        field_type,
                        entity: current_name,
                    },
                });
            }

            let target = self.entity(&relation.entity)?;
            hops.push(Hop {
                path: segments[..=i].join("__"),
                relation: relation.clone(),
                target_table: target.table.clone(),
                target_schema: target.schema.clone(),
            });
            current_name = relation.entity.clone();
            current = target;

            if last {
                return Ok(ResolvedPath {
                    hops,
                    target: PathTarget::Relation {
                        entity: current_name,
                    },
                });
            }
        }

        Err(CatalogError::EmptyPath(path.to_string()))
    }
}
