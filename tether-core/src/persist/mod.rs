//! Durable session state: anchors, UID maps and MD5 nonces.
//!
//! Backed by one SQLite file shared by every profile on the device. Two
//! sessions against the same file are serialized by a per-file async lock so
//! a save transaction never interleaves with another session's.

pub mod changelog;
pub mod nonces;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("could not open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Per-file locks shared across every `Database` in the process.
fn file_locks() -> &'static Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle to the persistence database.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Database {
    /// Open (creating if missing) the persistence database at `path` and
    /// ensure the schema exists.
    pub async fn open(path: &str) -> Result<Self, PersistError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| PersistError::Open { path: path.to_string(), source })?;

        let lock = {
            let mut locks = file_locks().lock().expect("file lock registry poisoned");
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let db = Database { pool, path: path.to_string(), lock };
        db.ensure_schema().await?;

        debug!(path = %db.path, "persistence database opened");

        Ok(db)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the per-file lock guarding multi-statement operations.
    pub(crate) async fn file_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Schema creation is idempotent; evolution is additive and unknown
    /// columns are ignored by every query.
    async fn ensure_schema(&self) -> Result<(), PersistError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS change_logs(\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             remote_device VARCHAR(512), \
             source_db_uri VARCHAR(512), \
             sync_direction INTEGER, \
             local_sync_anchor VARCHAR(128), \
             remote_sync_anchor VARCHAR(128), \
             last_sync_time TIMESTAMP)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS id_maps(\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             remote_device VARCHAR(512), \
             source_db_uri VARCHAR(512), \
             sync_direction INTEGER, \
             local_id VARCHAR(128), \
             remote_id VARCHAR(128))",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS nonces(\
             id INTEGER PRIMARY KEY AUTOINCREMENT, \
             local_device VARCHAR(512), \
             remote_device VARCHAR(512), \
             nonce VARCHAR(512))",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();

        // All three tables exist and are queryable.
        for table in ["change_logs", "id_maps", "nonces"] {
            let query = format!("SELECT COUNT(*) FROM {table}");
            sqlx::query(&query).execute(db.pool()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.db");
        let path = path.to_str().unwrap();

        let first = Database::open(path).await.unwrap();
        drop(first);
        Database::open(path).await.unwrap();
    }
}
