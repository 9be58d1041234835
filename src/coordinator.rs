//! Initialization Coordinator - at most one CSV load per table per process
//!
//! Concurrent `ensure_loaded` callers race to claim the NotStarted state;
//! exactly one wins and runs the loader, the rest poll until the state
//! settles. A failed load resets to NotStarted so a later caller can retry,
//! and the failure surfaces only to the caller that ran the load.

use crate::db::{ColumnInfo, Database};
use crate::error::Result;
use crate::loader;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Delay between polls while another caller's load is in progress
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cached result of the last successful load
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub table: String,
    pub row_count: usize,
    pub schema: Vec<ColumnInfo>,

    /// RFC 3339 timestamp of the load
    pub loaded_at: String,
}

#[derive(Debug)]
enum InitState {
    NotStarted,
    InProgress,
    Ready(TableInfo),
}

/// Payload-free state snapshot, exposed by `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    NotStarted,
    InProgress,
    Ready,
}

enum Step {
    Claimed,
    Wait,
    Done(TableInfo),
}

/// Process-wide guard around the one-time CSV load. Owned by the app
/// context, not a global, so independent instances can coexist in tests.
pub struct InitCoordinator {
    state: Mutex<InitState>,
    attempts: AtomicU32,
}

impl InitCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::NotStarted),
            attempts: AtomicU32::new(0),
        }
    }

    /// Current state, without the cached payload.
    pub fn status(&self) -> InitStatus {
        match *self.state.lock().unwrap() {
            InitState::NotStarted => InitStatus::NotStarted,
            InitState::InProgress => InitStatus::InProgress,
            InitState::Ready(_) => InitStatus::Ready,
        }
    }

    /// Number of load attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Ensure the table has been loaded from `source`, running the loader at
    /// most once across all concurrent callers.
    ///
    /// Fast path: once Ready, returns the cached schema with a fresh
    /// `COUNT(*)` from the engine - the file is never re-parsed. While a
    /// load is in progress, callers wait on a fixed-delay poll rather than
    /// spinning.
    pub async fn ensure_loaded(
        &self,
        db: &Database,
        source: &Path,
        table: &str,
    ) -> Result<TableInfo> {
        loop {
            // The state lock is never held across an await
            let step = {
                let mut state = self.state.lock().unwrap();
                match &*state {
                    InitState::Ready(info) => Step::Done(info.clone()),
                    InitState::InProgress => Step::Wait,
                    InitState::NotStarted => {
                        *state = InitState::InProgress;
                        Step::Claimed
                    }
                }
            };

            match step {
                Step::Done(mut info) => {
                    info.row_count = db.table_row_count(table)?;
                    return Ok(info);
                }
                Step::Wait => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Step::Claimed => return self.run_load(db, source, table),
            }
        }
    }

    /// Run the loader as the claiming caller. Success publishes Ready with
    /// the cached info; failure resets to NotStarted and propagates the
    /// error to this caller only.
    fn run_load(&self, db: &Database, source: &Path, table: &str) -> Result<TableInfo> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Starting CSV load attempt {} for '{}' from {}",
            attempt,
            table,
            source.display()
        );

        match loader::load(db, source, table) {
            Ok(summary) => {
                let info = TableInfo {
                    table: table.to_string(),
                    row_count: summary.row_count,
                    schema: summary.schema,
                    loaded_at: Utc::now().to_rfc3339(),
                };
                *self.state.lock().unwrap() = InitState::Ready(info.clone());
                Ok(info)
            }
            Err(e) => {
                warn!("CSV load attempt {} failed: {}", attempt, e);
                *self.state.lock().unwrap() = InitState::NotStarted;
                Err(e)
            }
        }
    }
}

impl Default for InitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_trigger_exactly_one_load() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "a,b\n1,x\n2,y\n3,z\n");

        let shared = Arc::new((InitCoordinator::new(), Database::open_in_memory().unwrap()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let shared = Arc::clone(&shared);
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                shared.0.ensure_loaded(&shared.1, &path, "orders").await
            }));
        }

        for handle in handles {
            let info = handle.await.unwrap().unwrap();
            assert_eq!(info.row_count, 3);
        }

        assert_eq!(shared.0.attempts(), 1);
        assert_eq!(shared.0.status(), InitStatus::Ready);
    }

    #[tokio::test]
    async fn test_failed_load_resets_state_and_allows_retry() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("orders.csv");
        let coordinator = InitCoordinator::new();
        let db = Database::open_in_memory().unwrap();

        match coordinator.ensure_loaded(&db, &missing, "orders").await {
            Err(AppError::NotFound(_)) => {}
            other => panic!("Expected NotFound, got {:?}", other.map(|i| i.row_count)),
        }
        assert_eq!(coordinator.status(), InitStatus::NotStarted);

        // A later caller can retry once the file shows up
        let path = write_csv(&dir, "orders.csv", "a,b\n1,x\n");
        let info = coordinator.ensure_loaded(&db, &path, "orders").await.unwrap();
        assert_eq!(info.row_count, 1);
        assert_eq!(coordinator.attempts(), 2);
    }

    #[tokio::test]
    async fn test_fast_path_does_not_reparse_file() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "a,b\n1,x\n2,y\n");
        let coordinator = InitCoordinator::new();
        let db = Database::open_in_memory().unwrap();

        let first = coordinator.ensure_loaded(&db, &path, "orders").await.unwrap();
        assert_eq!(first.row_count, 2);

        // Remove the source; the fast path must not touch it
        std::fs::remove_file(&path).unwrap();

        let second = coordinator.ensure_loaded(&db, &path, "orders").await.unwrap();
        assert_eq!(second.row_count, 2);
        assert_eq!(second.schema, first.schema);
        assert_eq!(coordinator.attempts(), 1);
    }

    #[tokio::test]
    async fn test_fast_path_reflects_later_dml() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "a,b\n1,x\n");
        let coordinator = InitCoordinator::new();
        let db = Database::open_in_memory().unwrap();

        coordinator.ensure_loaded(&db, &path, "orders").await.unwrap();
        db.execute("INSERT INTO orders VALUES ('2', 'y')").unwrap();

        let info = coordinator.ensure_loaded(&db, &path, "orders").await.unwrap();
        assert_eq!(info.row_count, 2);
    }

    #[tokio::test]
    async fn test_initial_status_is_not_started() {
        let coordinator = InitCoordinator::new();
        assert_eq!(coordinator.status(), InitStatus::NotStarted);
        assert_eq!(coordinator.attempts(), 0);
    }
}
