//! Handler-facing SQL access. Handlers get their own connection and file, so
//! their queries never hold the engine's connection lock.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::info;

use jobforge_core::Database;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open handler database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        info!(path = %path.as_ref().display(), "Handler database opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        // Nested values are stored as their JSON text.
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql).context("Failed to prepare query")?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let bound = rusqlite::params_from_iter(params.iter().map(to_sql));

        let mut rows = stmt.query(bound).context("Query failed")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            let mut object = Map::with_capacity(columns.len());
            for (i, name) in columns.iter().enumerate() {
                object.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Ok(out)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.conn.lock().await;
        let bound = rusqlite::params_from_iter(params.iter().map(to_sql));
        conn.execute(sql, bound).context("Statement failed")
    }
}
