//! HTTP API handlers
//!
//! Each handler returns a status code plus a JSON envelope; the server
//! binary only does wire-level work around these. `AppContext` owns all
//! shared state (config, database handle, initialization coordinator), so
//! independent instances can live side by side in tests.

use crate::config::Config;
use crate::coordinator::{InitCoordinator, InitStatus};
use crate::db::Database;
use crate::error::{AppError, Result};
use serde_json::{json, Value};

/// Shared per-process application state.
pub struct AppContext {
    pub config: Config,
    pub db: Database,
    pub coordinator: InitCoordinator,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            db: Database::open_in_memory()?,
            coordinator: InitCoordinator::new(),
            config,
        })
    }
}

/// Status code plus JSON body, ready for the wire.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn failure(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            status,
            json!({ "success": false, "message": message.into() }),
        )
    }
}

/// Request gate: everything under `/api/` except `/api/init` is refused
/// until the database has completed one successful load.
pub fn gate(ctx: &AppContext) -> Option<ApiResponse> {
    match ctx.coordinator.status() {
        InitStatus::Ready => None,
        _ => Some(ApiResponse::failure(
            503,
            "Database not initialized. Call POST /api/init first.",
        )),
    }
}

/// `POST /api/init` - trigger (or fast-path) the CSV load.
pub async fn handle_init(ctx: &AppContext) -> ApiResponse {
    let result = ctx
        .coordinator
        .ensure_loaded(&ctx.db, &ctx.config.csv_path, &ctx.config.table_name)
        .await;

    match result {
        Ok(info) => ApiResponse::new(
            200,
            json!({
                "success": true,
                "message": format!("Loaded {} rows into '{}'", info.row_count, info.table),
                "schema": info.schema,
                "rowCount": info.row_count,
                "loadedAt": info.loaded_at,
            }),
        ),
        Err(e) => {
            let status = match e {
                AppError::NotFound(_) => 404,
                _ => 500,
            };
            ApiResponse::failure(status, e.to_string())
        }
    }
}

/// `POST /api/query` - run arbitrary SQL from the request body.
pub fn handle_query(ctx: &AppContext, body: &str) -> ApiResponse {
    let query = body
        .find('{')
        .and_then(|start| serde_json::from_str::<Value>(&body[start..]).ok())
        .and_then(|v| v.get("query").and_then(|q| q.as_str()).map(String::from))
        .unwrap_or_default();

    if query.trim().is_empty() {
        return ApiResponse::failure(400, "Query text is required");
    }

    match ctx.db.execute(&query) {
        Ok(outcome) => ApiResponse::new(
            200,
            json!({
                "success": true,
                "data": outcome.rows,
                "rowCount": outcome.row_count,
                "executionTime": outcome.elapsed_ms,
                "message": format!("Query returned {} rows", outcome.row_count),
            }),
        ),
        Err(e) => ApiResponse::failure(400, e.to_string()),
    }
}

/// `GET /api/schema/:table` - column names and declared types.
pub fn handle_schema(ctx: &AppContext, table: &str) -> ApiResponse {
    match ctx.db.describe(table) {
        Ok(schema) => ApiResponse::new(200, json!({ "success": true, "schema": schema })),
        Err(AppError::NotFound(msg)) => ApiResponse::failure(404, msg),
        Err(e) => ApiResponse::failure(500, e.to_string()),
    }
}

/// `GET /health` - always 200, never gated.
pub fn handle_health(ctx: &AppContext) -> ApiResponse {
    let status = ctx.coordinator.status();
    ApiResponse::new(
        200,
        json!({
            "status": "ok",
            "dbInitialized": status == InitStatus::Ready,
            "dbInitializing": status == InitStatus::InProgress,
        }),
    )
}
