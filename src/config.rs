//! Server configuration from environment variables

use std::path::PathBuf;

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server listens on
    pub port: u16,

    /// Path to the CSV file imported into the database
    pub csv_path: PathBuf,

    /// Name of the managed table
    pub table_name: String,
}

impl Config {
    /// Read configuration from the environment, falling back to defaults.
    /// Call `dotenv::dotenv().ok()` before this to pick up a `.env` file.
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let csv_path = std::env::var("CSV_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("public/orders.csv"));

        let table_name = std::env::var("TABLE_NAME").unwrap_or_else(|_| "orders".to_string());

        Self {
            port,
            csv_path,
            table_name,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            csv_path: PathBuf::from("public/orders.csv"),
            table_name: "orders".to_string(),
        }
    }
}
