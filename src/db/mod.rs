//! Shared SQLite handle for the journal and memory store.
//!
//! One database file, one connection, writes serialized through an internal
//! `Mutex`. WAL mode keeps concurrent readers cheap on the SQLite side;
//! transactions are the atomicity unit for every multi-row write.

mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, TransactionBehavior};

pub(crate) use schema::read_schema_version;

/// Database-layer error.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error opening or creating the database.
    #[error("I/O error: {0}")]
    Io(String),

    /// `PRAGMA quick_check` reported a problem.
    #[error("database corrupt: {0}")]
    Corrupt(String),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("database lock poisoned")]
    Poisoned,
}

/// Single-writer handle to the embedded database.
pub struct Database {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file and bring the schema current.
    ///
    /// Enables WAL mode and foreign keys, then applies pending migrations
    /// in order. An integrity warning is logged but does not prevent
    /// opening; the caller decides how to handle corruption.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or a migration fails.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| DbError::Io(e.to_string()))?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::apply_migrations(&conn)?;

        let db = Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        };

        if let Err(e) = db.integrity_check() {
            tracing::warn!(error = %e, "database integrity check failed on startup");
        }

        Ok(db)
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if schema application fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::apply_migrations(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a fast structural integrity check (`PRAGMA quick_check`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Corrupt`] with the pragma's description when the
    /// database does not pass.
    pub fn integrity_check(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if result == "ok" {
            Ok(())
        } else {
            Err(DbError::Corrupt(result))
        }
    }

    /// Current schema version, `0` for a fresh database.
    ///
    /// # Errors
    ///
    /// Returns an error if the version row cannot be read.
    pub fn schema_version(&self) -> Result<u32, DbError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?.unwrap_or(0))
    }

    /// Run a read or single-statement write against the connection.
    ///
    /// # Errors
    ///
    /// Propagates any SQLite error from the closure.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    /// Run a closure inside an immediate transaction.
    ///
    /// Commits when the closure returns `Ok`; a failed transaction leaves
    /// the database unchanged.
    ///
    /// # Errors
    ///
    /// Propagates any SQLite error from the closure or the commit.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }
}
