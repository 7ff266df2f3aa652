//! Temp-file databases.

use anyhow::Result;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use vetdispatch_db::DispatchDb;

/// RAII guard for a file-backed test database.
///
/// Race tests need a file, not `:memory:`: WAL mode lets every pooled
/// connection see the same data while SQLite serializes the writers.
/// The directory, and with it the database, is deleted on Drop.
pub struct TestDb {
    db: DispatchDb,
    path: PathBuf,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vetdispatch.sqlite3");
        debug!("Creating test database: {}", path.display());
        let db = DispatchDb::open(&path).await?;
        Ok(Self {
            db,
            path,
            _dir: dir,
        })
    }

    pub fn db(&self) -> DispatchDb {
        self.db.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a second, independent pool on the same file, as another process would.
    pub async fn reopen(&self) -> Result<DispatchDb> {
        Ok(DispatchDb::open(&self.path).await?)
    }
}

impl Deref for TestDb {
    type Target = DispatchDb;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}
