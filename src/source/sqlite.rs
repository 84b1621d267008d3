//! SQLite data source.
//!
//! Registers the `regexp(pattern, text)` and `power(x, y)` functions the
//! SQLite dialect emits. Values map to JSON as: integers and reals to
//! numbers (non-finite reals to null), text to strings, blobs to base64.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Number, Value};
use tracing::debug;

use super::{DataSource, SourceResult};
use crate::model::Row;
use crate::sql::dialect::Dialect;
use crate::sql::query::Query;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    pub fn open<P: AsRef<Path>>(path: P) -> SourceResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SourceResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> SourceResult<Self> {
        register_functions(&conn)?;
        Ok(Self { conn })
    }

    /// Run DDL/DML, typically fixtures.
    pub fn execute_batch(&self, sql: &str) -> SourceResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("regexp", 2, flags, |ctx| {
        let re: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
            Ok(Regex::new(vr.as_str()?)?)
        })?;
        let text: Option<String> = ctx.get(1)?;
        Ok(text.map(|t| re.is_match(&t)))
    })?;

    conn.create_scalar_function("power", 2, flags, |ctx| {
        let base: Option<f64> = ctx.get(0)?;
        let exponent: Option<f64> = ctx.get(1)?;
        Ok(base
            .zip(exponent)
            .map(|(b, e)| b.powf(e))
            .filter(|v| v.is_finite()))
    })?;

    Ok(())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    }
}

impl DataSource for SqliteSource {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn fetch(&self, query: &Query) -> SourceResult<Vec<Row>> {
        let sql = query.to_sql(Dialect::Sqlite);
        debug!(sql = %sql, "executing query");

        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt.query_map([], |row| {
            let mut out = Row::new();
            for (i, name) in columns.iter().enumerate() {
                out.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            Ok(out)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
