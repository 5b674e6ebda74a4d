//! libSQL database handle — connection wrapper and migrations.

use std::path::Path;
use std::sync::Arc;

use libsql::Connection;
use tracing::info;

use crate::error::DatabaseError;
use crate::store::migrations;

/// Shared database handle.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use;
/// individual statements are atomic. Anything spanning multiple statements
/// (transactions, consistent multi-table reads) must hold [`Database::exclusive`]
/// for its duration, otherwise statements from other tasks interleave into
/// the open transaction.
pub struct Database {
    #[allow(dead_code)]
    db: Arc<libsql::Database>,
    conn: Connection,
    gate: tokio::sync::Mutex<()>,
}

impl Database {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_db(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Open(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_db(db).await
    }

    async fn from_db(db: libsql::Database) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        // Cascade deletes (rule -> addresses/filters) need this; SQLite keeps
        // foreign keys off unless every connection opts in.
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: tokio::sync::Mutex::new(()),
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Serialize multi-statement access. The workload is write-light, so a
    /// single whole-operation lock is plenty.
    pub async fn exclusive(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }
}
