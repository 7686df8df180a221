//! # Database Pool Management
//!
//! Opens the SQLite local store and hands out repositories.
//!
//! ## Who Uses The Pool
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Scheduler cycle ──┐                                                   │
//! │   Webhook worker ───┼──► EntitySyncer ──► write lane ──► db.records()   │
//! │   Status counts ────┘                                     db.cursors()  │
//! │                                                               │         │
//! │                                          ┌────────────────────▼──────┐  │
//! │                                          │ SqlitePool                │  │
//! │                                          │  file:   WAL, N conns     │  │
//! │                                          │  memory: 1 pinned conn    │  │
//! │                                          └───────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writers are already serialized by the engine, so the pool mostly serves
//! concurrent readers. `busy_timeout` covers the short window where a reader
//! checkpoint and a write overlap.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::cursor::CursorRepository;
use crate::repository::record::RecordRepository;

// =============================================================================
// Configuration
// =============================================================================

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Private to one pool; gone when the pool closes.
    Memory,
}

/// Store configuration.
///
/// ```rust,ignore
/// let config = DbConfig::new("/var/lib/tally/tally.db").max_connections(4);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub location: StoreLocation,

    /// Default: 5 for files. Memory stores always use one.
    pub max_connections: u32,

    /// How long to wait for a free connection. Default: 30 s.
    pub acquire_timeout: Duration,

    /// How long SQLite retries a locked database before failing. Default: 5 s.
    pub busy_timeout: Duration,

    /// Default: true.
    pub run_migrations: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            location: StoreLocation::File(path.into()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    /// Isolated in-memory store for tests.
    pub fn in_memory() -> Self {
        DbConfig {
            location: StoreLocation::Memory,
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.location == StoreLocation::Memory
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = match &self.location {
            StoreLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::Open(e.to_string()))?,
            StoreLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
        };
        // Match-key rows cascade with their record.
        Ok(options.foreign_keys(true).busy_timeout(self.busy_timeout))
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new().acquire_timeout(self.acquire_timeout);
        match self.location {
            // The data lives in the connection; never let the pool recycle it.
            StoreLocation::Memory => options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            StoreLocation::File(_) => options
                .max_connections(self.max_connections)
                .min_connections(1)
                .idle_timeout(Some(Duration::from_secs(600))),
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the local store. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the store and applies migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        match &config.location {
            StoreLocation::File(path) => info!(path = %path.display(), "Opening local store"),
            StoreLocation::Memory => debug!("Opening in-memory store"),
        }

        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::Open(e.to_string()))?;

        let db = Database { pool };
        if config.run_migrations {
            migrations::run_migrations(&db.pool).await?;
        }
        Ok(db)
    }

    /// Opens a file store, creating its parent directory first.
    pub async fn open_file(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| DbError::Open(format!("{}: {e}", parent.display())))?;
        }
        Database::new(DbConfig::new(path)).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }

    pub fn cursors(&self) -> CursorRepository {
        CursorRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        debug!("Closing local store");
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_opens_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sync_records'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, 1);
    }

    #[tokio::test]
    async fn test_in_memory_stores_are_isolated() {
        let a = Database::new(DbConfig::in_memory()).await.unwrap();
        let b = Database::new(DbConfig::in_memory()).await.unwrap();

        sqlx::query("INSERT INTO sync_cursors (entity_kind, name, value_ms) VALUES ('customer', 'x', 1)")
            .execute(a.pool())
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_cursors")
            .fetch_one(b.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/tally-test.db")
            .max_connections(0)
            .run_migrations(false);

        assert_eq!(config.max_connections, 1);
        assert!(!config.run_migrations);
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }
}
