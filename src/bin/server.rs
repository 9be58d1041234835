//! HTTP server for the CSV query service
//! Simple HTTP server using tokio and basic HTTP handling

use csvql::api::{self, ApiResponse, AppContext};
use csvql::config::Config;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    println!("Starting csvql API server...");
    println!("Server will run on http://localhost:{}", config.port);

    let ctx = Arc::new(AppContext::new(config)?);

    let listener = TcpListener::bind(("0.0.0.0", ctx.config.port)).await?;
    println!("[OK] Server listening on port {}", ctx.config.port);

    // Best-effort auto-load: the server accepts connections either way, and
    // /api/init remains available for manual retry.
    if ctx.config.csv_path.exists() {
        let auto_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let result = auto_ctx
                .coordinator
                .ensure_loaded(
                    &auto_ctx.db,
                    &auto_ctx.config.csv_path,
                    &auto_ctx.config.table_name,
                )
                .await;
            match result {
                Ok(table_info) => info!(
                    "Auto-loaded {} rows into '{}'",
                    table_info.row_count, table_info.table
                ),
                Err(e) => warn!("Auto-load failed, call POST /api/init to retry: {}", e),
            }
        });
    } else {
        warn!(
            "CSV file {} not present, skipping auto-load",
            ctx.config.csv_path.display()
        );
    }

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from {}", addr);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(handle_connection(stream, ctx));
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<AppContext>) {
    use tokio::time::{timeout, Duration};

    // Read request with timeout to prevent hanging
    let mut buffer = Vec::new();
    let mut temp_buf = [0; 8192];

    let read_result = timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut temp_buf).await {
                Ok(0) => break, // EOF
                Ok(n) => {
                    buffer.extend_from_slice(&temp_buf[..n]);
                    // Check if we've reached the end of HTTP headers + body
                    if let Ok(s) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = s.find("\r\n\r\n") {
                            // We have headers, check if we have the full body
                            if let Some(content_length) = extract_content_length(s) {
                                if buffer.len() >= headers_end + 4 + content_length {
                                    break; // We have the complete request
                                }
                            } else if n < temp_buf.len() {
                                // No content-length header and we got less than buffer size
                                break;
                            }
                        }
                    }
                    // If buffer is getting too large, break to prevent memory issues
                    if buffer.len() > 1_000_000 {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read from stream: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    })
    .await;

    if read_result.is_err() {
        warn!("Request read timeout");
        return;
    }

    if buffer.is_empty() {
        return;
    }

    match String::from_utf8(buffer) {
        Ok(request) => {
            let response = handle_request(&request, &ctx).await;
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                warn!("Failed to write response: {}", e);
            }
        }
        Err(e) => {
            warn!("Failed to parse request as UTF-8: {}", e);
        }
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    for line in request.lines() {
        if line.to_lowercase().starts_with("content-length:") {
            if let Some(value) = line.split(':').nth(1) {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

async fn handle_request(request: &str, ctx: &AppContext) -> String {
    let request_line = match request.lines().next() {
        Some(line) => line,
        None => return render(ApiResponse { status: 400, body: serde_json::json!({"success": false, "message": "Bad request"}) }),
    };

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return render(ApiResponse {
            status: 400,
            body: serde_json::json!({"success": false, "message": "Bad request"}),
        });
    }

    let method = parts[0];
    let full_path = parts[1];

    // Strip any query string, then normalize trailing slashes
    let path_str = full_path.split('?').next().unwrap_or(full_path);
    let mut normalized_path = path_str.trim_end_matches('/').to_string();
    if normalized_path.is_empty() {
        normalized_path = "/".to_string();
    }
    let path = normalized_path.as_str();

    info!("Request: {} {}", method, path);

    let body_start = request.find("\r\n\r\n").map(|p| p + 4).unwrap_or(request.len());
    let body = &request[body_start..];

    let response = match (method, path) {
        // CORS preflight
        ("OPTIONS", _) => return create_response(204, "No Content", ""),

        ("GET", "/health") => api::handle_health(ctx),

        ("POST", "/api/init") => api::handle_init(ctx).await,

        _ if path.starts_with("/api/") => {
            // Request gate: everything else under /api/ needs a loaded table
            if let Some(refusal) = api::gate(ctx) {
                refusal
            } else {
                match (method, path) {
                    ("POST", "/api/query") => api::handle_query(ctx, body),
                    ("GET", p) if p.starts_with("/api/schema/") => {
                        api::handle_schema(ctx, &p["/api/schema/".len()..])
                    }
                    _ => ApiResponse {
                        status: 404,
                        body: serde_json::json!({"success": false, "message": "Route not found"}),
                    },
                }
            }
        }

        _ => ApiResponse {
            status: 404,
            body: serde_json::json!({"success": false, "message": "Route not found"}),
        },
    };

    render(response)
}

fn render(response: ApiResponse) -> String {
    create_response(
        response.status,
        status_text(response.status),
        &response.body.to_string(),
    )
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, PUT, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
