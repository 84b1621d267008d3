//! Shared fixtures: a small shop schema in in-memory SQLite.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use mantis_query::config::Settings;
use mantis_query::engine::{DatasetEngine, SchemaContext};
use mantis_query::model::{Catalog, DatasetDefinition, QueryRequest, Row};
use mantis_query::source::SqliteSource;
use mantis_query::sql::Dialect;
use serde_json::{json, Value};

pub const CATALOG: &str = r#"
[entities.orders]
table = "orders"
fields = { id = "int", status = "string", amount = "float", created = "date", customer_id = "int" }

[entities.orders.relations.customer]
entity = "customers"
kind = "to_one"
local_column = "customer_id"
remote_column = "id"

[entities.orders.relations.lines]
entity = "order_lines"
kind = "to_many"
local_column = "id"
remote_column = "order_id"

[entities.orders.history]
table = "order_history"
key_column = "order_id"
timestamp_column = "changed_at"

[entities.customers]
table = "customers"
fields = { id = "int", name = "string", region = "string", email = "string" }

[entities.order_lines]
table = "order_lines"
fields = { id = "int", order_id = "int", sku = "string", quantity = "int", price = "float" }
"#;

const FIXTURE: &str = "
CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT, region TEXT, email TEXT);
INSERT INTO customers VALUES (1, 'Ada', 'EU', 'ada@example.com');
INSERT INTO customers VALUES (2, 'Bob', 'US', NULL);
INSERT INTO customers VALUES (3, 'Cyd', 'EU', 'cyd@example.org');

CREATE TABLE orders (id INTEGER PRIMARY KEY, status TEXT, amount REAL, created TEXT, customer_id INTEGER);
INSERT INTO orders VALUES (1, 'paid', 120.0, '2024-01-15', 1);
INSERT INTO orders VALUES (2, 'paid', 80.0, '2024-02-03', 2);
INSERT INTO orders VALUES (3, 'open', 40.0, '2024-02-20', 1);
INSERT INTO orders VALUES (4, 'refunded', 60.0, '2024-03-01', 3);
INSERT INTO orders VALUES (5, 'paid', 200.0, '2024-03-10', 3);

CREATE TABLE order_lines (id INTEGER PRIMARY KEY, order_id INTEGER, sku TEXT, quantity INTEGER, price REAL);
INSERT INTO order_lines VALUES (1, 1, 'A-1', 2, 30.0);
INSERT INTO order_lines VALUES (2, 1, 'B-2', 1, 60.0);
INSERT INTO order_lines VALUES (3, 2, 'A-1', 4, 20.0);
INSERT INTO order_lines VALUES (4, 3, 'C-3', 1, 40.0);
INSERT INTO order_lines VALUES (5, 5, 'A-1', 10, 20.0);

CREATE TABLE order_history (id INTEGER PRIMARY KEY, order_id INTEGER, status TEXT, changed_at TEXT);
INSERT INTO order_history VALUES (1, 1, 'open', '2024-01-10');
INSERT INTO order_history VALUES (2, 4, 'paid', '2024-02-25');
INSERT INTO order_history VALUES (3, 5, 'open', '2024-03-05');
";

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()
}

pub fn catalog() -> Catalog {
    Catalog::from_toml_str(CATALOG).unwrap()
}

pub fn source() -> SqliteSource {
    let source = SqliteSource::open_in_memory().unwrap();
    source.execute_batch(FIXTURE).unwrap();
    source
}

pub fn orders_dataset() -> DatasetDefinition {
    serde_json::from_value(json!({
        "code": "orders",
        "title": "Orders",
        "source": "orders",
        "dimensions": [
            {"field": "status"},
            {"field": "customer__region", "name": "region"},
            {"field": "created", "transform": "trunc:month"}
        ],
        "metrics": [
            {"field": "amount", "aggregation": "sum", "name": "revenue"},
            {"aggregation": "count", "name": "orders"},
            {"aggregation": "count", "name": "paid_orders", "filter": {"status": "paid"}}
        ],
        "computed_fields": [
            {"name": "avg_order", "formula": "revenue / orders", "stage": "query"}
        ],
        "ordering": ["id"],
        "metadata": {
            "record_fields": ["id", "status", "amount", "created", "customer__name", "customer__region"],
            "quick_search_fields": ["status", "customer__name"],
            "max_limit": 50
        }
    }))
    .unwrap()
}

pub fn engine_for(dataset: DatasetDefinition) -> DatasetEngine {
    engine_with(dataset, Settings::default())
}

pub fn engine_with(dataset: DatasetDefinition, settings: Settings) -> DatasetEngine {
    let context = Arc::new(SchemaContext::new(catalog(), Dialect::Sqlite));
    DatasetEngine::new(dataset, context, settings).with_today(today())
}

pub fn request(value: Value) -> QueryRequest {
    serde_json::from_value(value).unwrap()
}

/// Values of `column` across `rows`, in order.
pub fn column(rows: &[Row], column: &str) -> Vec<Value> {
    rows.iter()
        .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
        .collect()
}
