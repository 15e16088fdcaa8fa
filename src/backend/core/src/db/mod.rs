//! Database layer for Runforge.
//!
//! SQLite through sqlx. Job definitions and their runtime bookkeeping live in
//! `scheduled_jobs`; one row per run lives in `job_executions`.

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::Result;

mod executions;
mod jobs;

pub use executions::{BeginOutcome, CompletedRun, StopOutcome, INTERRUPTED_BY_RESTART, STOPPED_BY_USER};

/// Database connection and operations.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("size", &self.pool.size())
            .finish()
    }
}

impl Database {
    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// A private in-memory database, already migrated.
    ///
    /// Held on a single connection that never expires, since every new
    /// connection to `:memory:` would see an empty database.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query and report pool state.
    pub async fn health(&self) -> DatabaseHealth {
        let start = Instant::now();
        let result = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await;

        DatabaseHealth {
            healthy: result.is_ok(),
            latency_ms: start.elapsed().as_millis() as u64,
            pool_size: self.pool.size(),
            idle_connections: self.pool.num_idle() as u32,
            error: result.err().map(|e| e.to_string()),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Outcome of [`Database::health`].
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub pool_size: u32,
    pub idle_connections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::connect_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);

        let health = db.health().await;
        assert!(health.healthy);
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("forge.db").display());
        let db = Database::connect(&url, 2).await.unwrap();
        db.migrate().await.unwrap();
        assert!(dir.path().join("forge.db").exists());
        db.close().await;
    }
}
