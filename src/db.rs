//! Database access - one shared in-memory SQLite connection
//!
//! All engine calls go through `Database`, which serializes access with a
//! mutex. `execute` is the single pass-through seam for arbitrary SQL from
//! trusted callers; future hardening (read-only mode, statement limits)
//! belongs here.

use crate::error::{AppError, Result};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

/// One column of a table schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,

    /// Declared SQL type (always TEXT for loader-created columns)
    #[serde(rename = "type")]
    pub data_type: String,
}

/// Result of executing one SQL statement
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Rows shaped as JSON objects keyed by column name
    pub rows: Vec<Value>,

    pub row_count: usize,

    /// Wall-clock time spent in the engine, in milliseconds
    pub elapsed_ms: u64,
}

/// Shared handle to the embedded database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open a fresh transient in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Load(format!("Failed to open in-memory database: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure with exclusive access to the underlying connection.
    /// Used by the loader for its transactional batch inserts; the lock is
    /// held for the whole closure, so readers never observe a half-loaded
    /// table.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }

    /// Execute arbitrary SQL and shape the result as JSON rows.
    ///
    /// The full SQLite dialect is allowed, DDL/DML included - callers are
    /// trusted. Statements that produce no result set return zero rows.
    pub fn execute(&self, sql: &str) -> Result<QueryOutcome> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(AppError::BadRequest("Query text is required".to_string()));
        }

        let conn = self.conn.lock().unwrap();
        let started = Instant::now();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| AppError::Query(e.to_string()))?;

        // DDL/DML statements have no result columns; run them directly.
        if stmt.column_count() == 0 {
            let changed = stmt
                .execute([])
                .map_err(|e| AppError::Query(e.to_string()))?;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            debug!("Statement affected {} rows in {}ms", changed, elapsed_ms);

            return Ok(QueryOutcome {
                rows: Vec::new(),
                row_count: 0,
                elapsed_ms,
            });
        }

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt
            .query([])
            .map_err(|e| AppError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| AppError::Query(e.to_string()))? {
            let mut obj = Map::new();
            for (idx, name) in columns.iter().enumerate() {
                let value = row
                    .get_ref(idx)
                    .map_err(|e| AppError::Query(e.to_string()))?;
                obj.insert(name.clone(), value_to_json(value));
            }
            out.push(Value::Object(obj));
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let row_count = out.len();

        debug!("Query returned {} rows in {}ms", row_count, elapsed_ms);

        Ok(QueryOutcome {
            rows: out,
            row_count,
            elapsed_ms,
        })
    }

    /// Describe a table's columns from engine metadata.
    /// An empty result means the table does not exist, which is reported as
    /// `NotFound` rather than an engine error.
    pub fn describe(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare("SELECT name, type FROM pragma_table_info(?1)")
            .map_err(|e| AppError::Query(e.to_string()))?;

        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                })
            })
            .map_err(|e| AppError::Query(e.to_string()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| AppError::Query(e.to_string()))?;

        if columns.is_empty() {
            return Err(AppError::NotFound(format!(
                "Table '{}' does not exist",
                table
            )));
        }

        Ok(columns)
    }

    /// Current row count of a table.
    pub fn table_row_count(&self, table: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Query(e.to_string()))?;

        Ok(count as usize)
    }
}

/// Quote an identifier for embedding in SQL text (embedded quotes doubled).
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_rows() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (a TEXT, b TEXT)").unwrap();
        db.execute("INSERT INTO t VALUES ('1', 'x'), ('2', 'y')")
            .unwrap();
        db
    }

    #[test]
    fn test_execute_select() {
        let db = db_with_rows();
        let outcome = db.execute("SELECT * FROM t ORDER BY a").unwrap();

        assert_eq!(outcome.row_count, 2);
        assert_eq!(outcome.rows[0]["a"], "1");
        assert_eq!(outcome.rows[0]["b"], "x");
        assert_eq!(outcome.rows[1]["a"], "2");
    }

    #[test]
    fn test_execute_empty_query_is_bad_request() {
        let db = Database::open_in_memory().unwrap();
        match db.execute("   ") {
            Err(AppError::BadRequest(_)) => {}
            other => panic!("Expected BadRequest, got {:?}", other.map(|o| o.row_count)),
        }
    }

    #[test]
    fn test_execute_syntax_error_carries_engine_message() {
        let db = db_with_rows();
        match db.execute("SELEKT * FROM t") {
            Err(AppError::Query(msg)) => assert!(msg.contains("syntax error"), "message: {}", msg),
            other => panic!("Expected Query error, got {:?}", other.map(|o| o.row_count)),
        }
    }

    #[test]
    fn test_execute_ddl_returns_no_rows() {
        let db = Database::open_in_memory().unwrap();
        let outcome = db.execute("CREATE TABLE made (x TEXT)").unwrap();
        assert_eq!(outcome.row_count, 0);
        assert!(outcome.rows.is_empty());

        // The DDL actually took effect
        assert_eq!(db.describe("made").unwrap().len(), 1);
    }

    #[test]
    fn test_describe_missing_table_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        match db.describe("nope") {
            Err(AppError::NotFound(_)) => {}
            other => panic!("Expected NotFound, got {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn test_describe_lists_columns_in_order() {
        let db = db_with_rows();
        let schema = db.describe("t").unwrap();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema[0].name, "a");
        assert_eq!(schema[1].name, "b");
        assert_eq!(schema[0].data_type, "TEXT");
    }

    #[test]
    fn test_quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_row_count() {
        let db = db_with_rows();
        assert_eq!(db.table_row_count("t").unwrap(), 2);
    }
}
