//! CSV Loader - streams a CSV file into the managed table
//!
//! The header decides the schema: one TEXT column per field, no
//! content-based type inference. Data rows are inserted in fixed-size
//! batches through a single reused prepared statement, one transaction per
//! batch, so a batch either lands completely or the load fails.

use crate::db::{quote_ident, ColumnInfo, Database};
use crate::error::{AppError, Result};
use csv::ReaderBuilder;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::Path;
use tracing::{debug, info};

/// Rows buffered per insert batch
pub const BATCH_SIZE: usize = 1000;

/// One CSV field bound as a SQL parameter. Values stay untyped end to end:
/// either the raw text or NULL for fields missing from a short row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Null,
    Text(String),
}

impl ToSql for Field {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Field::Null => Ok(ToSqlOutput::Borrowed(ValueRef::Null)),
            Field::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
        }
    }
}

/// Outcome of one completed load
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub row_count: usize,

    /// Number of insert batches flushed
    pub batches: usize,

    pub schema: Vec<ColumnInfo>,
}

/// Import `path` into `table`, replacing any previous contents.
///
/// The table is dropped and recreated from the CSV header before any row is
/// inserted. Ragged rows are tolerated: short rows are padded with NULL,
/// long rows truncated to the header width.
pub fn load(db: &Database, path: &Path, table: &str) -> Result<LoadSummary> {
    if !path.exists() {
        return Err(AppError::NotFound(format!(
            "CSV file not found: {}",
            path.display()
        )));
    }

    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| AppError::Load(format!("Failed to open CSV file: {}", e)))?;

    let headers = rdr
        .headers()
        .map_err(|e| AppError::SchemaInference(format!("Failed to read CSV header: {}", e)))?;

    let schema: Vec<ColumnInfo> = headers
        .iter()
        .map(|h| ColumnInfo {
            name: h.trim().to_string(),
            data_type: "TEXT".to_string(),
        })
        .collect();

    if schema.is_empty() || schema.iter().all(|c| c.name.is_empty()) {
        return Err(AppError::SchemaInference(
            "CSV header is empty".to_string(),
        ));
    }

    let width = schema.len();
    let quoted_table = quote_ident(table);

    let column_defs = schema
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(&c.name)))
        .collect::<Vec<_>>()
        .join(", ");

    let placeholders = (1..=width)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    let insert_sql = format!("INSERT INTO {} VALUES ({})", quoted_table, placeholders);

    // The connection lock is held for the whole load, so no reader can
    // observe the table between DROP and the final batch.
    let (row_count, batches) = db.with_conn(|conn| {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quoted_table), [])
            .map_err(|e| AppError::Load(format!("Failed to drop table: {}", e)))?;

        conn.execute(
            &format!("CREATE TABLE {} ({})", quoted_table, column_defs),
            [],
        )
        .map_err(|e| AppError::Load(format!("Failed to create table: {}", e)))?;

        let mut batch: Vec<Vec<Field>> = Vec::with_capacity(BATCH_SIZE);
        let mut row_count = 0usize;
        let mut batches = 0usize;

        for result in rdr.records() {
            let record =
                result.map_err(|e| AppError::Load(format!("Failed to read CSV record: {}", e)))?;

            // Pad short rows, truncate long ones
            let row: Vec<Field> = (0..width)
                .map(|idx| match record.get(idx) {
                    Some(value) => Field::Text(value.to_string()),
                    None => Field::Null,
                })
                .collect();

            batch.push(row);
            row_count += 1;

            if batch.len() == BATCH_SIZE {
                flush_batch(conn, &insert_sql, &batch)?;
                batches += 1;
                debug!("Flushed batch {} ({} rows)", batches, BATCH_SIZE);
                batch.clear();
            }
        }

        if !batch.is_empty() {
            let size = batch.len();
            flush_batch(conn, &insert_sql, &batch)?;
            batches += 1;
            debug!("Flushed batch {} ({} rows)", batches, size);
        }

        Ok((row_count, batches))
    })?;

    info!(
        "Loaded {} rows into '{}' in {} batches",
        row_count, table, batches
    );

    Ok(LoadSummary {
        row_count,
        batches,
        schema,
    })
}

/// Insert one buffered batch inside a transaction, reusing one prepared
/// statement. Any statement failure rolls the batch back and aborts the
/// load.
fn flush_batch(conn: &mut Connection, insert_sql: &str, batch: &[Vec<Field>]) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| AppError::Load(format!("Failed to start transaction: {}", e)))?;

    {
        let mut stmt = tx
            .prepare(insert_sql)
            .map_err(|e| AppError::Load(format!("Failed to prepare insert: {}", e)))?;

        for row in batch {
            stmt.execute(rusqlite::params_from_iter(row.iter()))
                .map_err(|e| AppError::Load(format!("Failed to insert row: {}", e)))?;
        }
    }

    tx.commit()
        .map_err(|e| AppError::Load(format!("Failed to commit batch: {}", e)))?;

    Ok(())
}
