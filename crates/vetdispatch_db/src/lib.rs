//! Unified store for the vetdispatch engine.
//!
//! Every durable fact about a dispatch lives here: cases, per-candidate
//! dispatch rows, single-use action tokens, the email delivery log and the
//! vet roster. There is no in-process lock anywhere in the engine; the case
//! row is the synchronization point and every transition out of OPEN is a
//! conditional `UPDATE ... WHERE status = 'OPEN'`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vetdispatch_db::{DispatchDb, Result};
//!
//! let db = DispatchDb::open("~/.vetdispatch/vetdispatch.sqlite3").await?;
//!
//! let case = db.insert_case(&new_case, ttl).await?;
//! let rows = db.list_dispatch_candidates(&case.id).await?;
//! ```
//!
//! # Transactions
//!
//! Multi-row transitions (claim, decline, dispatch) are composed by the engine
//! from the `*_in` functions, which take `&mut SqliteConnection` so they run
//! inside a transaction from [`DispatchDb::begin`]. Every such transaction
//! must open with a write, so SQLite takes the write lock before any read
//! and concurrent claimers serialize instead of failing on a stale snapshot.

mod error;
mod schema;
mod types;

// Method implementations organized by table
pub mod candidates;
pub mod cases;
pub mod delivery_log;
pub mod roster;
pub mod tokens;

pub use error::{DbError, Result};
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub use sqlx::SqliteConnection;

/// Transaction handle used by the engine to compose conditional writes.
pub type DbTransaction = sqlx::Transaction<'static, sqlx::Sqlite>;

/// How long a writer waits for the SQLite write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Store for all dispatch state.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct DispatchDb {
    pool: SqlitePool,
}

impl DispatchDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Dispatch database opened");

        Ok(db)
    }

    /// Open a private in-memory database (single connection, for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        // One connection that never idles out, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Get the underlying connection pool (escape hatch for ad-hoc queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction. The first statement executed in it should be a write.
    pub async fn begin(&self) -> Result<DbTransaction> {
        Ok(self.pool.begin().await?)
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl DispatchDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }

    pub(crate) fn opt_millis_to_datetime(
        millis: Option<i64>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        millis.map(Self::millis_to_datetime)
    }
}

/// Parse a stored text column back into its domain type.
pub(crate) fn parse_column<T>(value: &str, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| DbError::invalid_state(format!("{}: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("dispatch.db");

        let db = DispatchDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());

        db.close().await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("dispatch.db");

        DispatchDb::open(&db_path).await.unwrap().close().await;
        let db = DispatchDb::open(&db_path).await.unwrap();
        let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM dispatch_schema_version")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_in_memory_survives_idle() {
        let db = DispatchDb::open_in_memory().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_cases")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
