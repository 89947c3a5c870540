//! Relational store handle
//!
//! A [`Database`] owns the single SQLite connection of a vault. The
//! connection sits behind a `parking_lot` mutex; a [`Transaction`] holds the
//! guard for its whole lifetime, so one transaction scope at a time talks to
//! the store. Together with `BEGIN IMMEDIATE` at the first flush this
//! serializes writers, including orphan collection against ingestion.

use crate::error::{Result, VaultError};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// SQLite connection shared by all components of a vault
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl Database {
    /// Open (or create) the database file at `path`
    ///
    /// Enables WAL journaling and foreign-key enforcement, and sets a busy
    /// timeout matching `lock_timeout`.
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        debug!("Opening database at {:?}", path);
        let conn = Connection::open(path)?;
        conn.busy_timeout(lock_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Journal mode {}", mode);
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            lock_timeout,
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            lock_timeout: Duration::from_secs(10),
        })
    }

    /// Set how long [`Database::transaction`] waits for the connection
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start a transaction context
    ///
    /// The returned object is closed; operations enter it with
    /// [`Transaction::scope`].
    ///
    /// # Errors
    ///
    /// - [`VaultError::LockTimeout`] if another transaction holds the
    ///   connection for longer than the configured timeout
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        let guard = self
            .conn
            .try_lock_for(self.lock_timeout)
            .ok_or(VaultError::LockTimeout)?;
        Ok(Transaction::new(guard))
    }
}
