//! SQLite handle for the gateway.
//!
//! One database file holds sessions, messages and clients. Write-heavy turn
//! traffic runs under WAL with NORMAL synchronous writes; foreign keys are
//! enforced so deleting a session cascades to its messages.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;

const POOL_SIZE: u32 = 5;

/// How long a writer waits on a locked database before giving up. Generous,
/// since turn runners and REST handlers share the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the gateway database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the database at `path`, creating the file and its parent
    /// directory on first use.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        Self::connect(options, POOL_SIZE).await
    }

    /// In-memory database for tests. Pinned to a single connection, which
    /// is what keeps the database alive; WAL does not apply here.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true).foreign_keys(true);
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("opening database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running database migrations")?;

        Ok(Self { pool })
    }

    /// The shared connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
