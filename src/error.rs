//! Error types for the labvault library
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! [`VaultError`] carries enough context to tell the caller *which* category of
//! failure occurred (lookup, schema, storage, integrity) and, where it applies,
//! which file or queued statement triggered it.

use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the labvault library
pub type Result<T> = std::result::Result<T, VaultError>;

/// Broad failure category, used by callers that only need to branch on the
/// kind of problem rather than its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown category, type tag, mountpoint or row
    Lookup,
    /// A write references columns or tables absent from the store
    Schema,
    /// Filesystem transfer or deletion failure
    Storage,
    /// Checksum mismatch on read-back
    Integrity,
    /// Relational store failure
    Database,
    /// Bad or missing configuration
    Configuration,
    /// Unexpected internal condition
    Internal,
}

/// Main error type for all labvault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors raised by the relational store
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A queued statement failed while the transaction was being flushed
    #[error("Statement {index} failed ({sql}): {source}")]
    StatementFailed {
        /// Position of the statement inside the flushed batch
        index: usize,
        /// SQL text of the failing statement
        sql: String,
        /// Underlying store error
        #[source]
        source: rusqlite::Error,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Unknown category, type tag, mountpoint or row
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// Write references columns absent from the target table
    #[error("Column error: {0}")]
    Column(String),

    /// Table or foreign-key layout does not match what the operation needs
    #[error("Schema error: {0}")]
    Schema(String),

    /// Filesystem transfer or deletion failure
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        /// Path that could not be transferred or removed
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Checksum mismatch detected on read-back verification
    #[error("Integrity error at {path:?}: expected checksum {expected}, found {actual}")]
    Integrity {
        /// File whose content no longer matches its record
        path: PathBuf,
        /// Checksum stored in the filepath row
        expected: u32,
        /// Checksum computed from the current content
        actual: u32,
    },

    /// Transaction used in a state that does not allow the operation
    #[error("Transaction state error: {0}")]
    TransactionState(String),

    /// Storage is not initialized
    #[error("Storage not initialized at path: {0:?}")]
    StorageNotInitialized(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Path conversion error
    #[error("Path conversion error: {0:?}")]
    PathConversion(OsString),

    /// Lock acquisition timeout
    #[error("Lock acquisition timeout")]
    LockTimeout,

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Create a lookup error with a custom message
    pub fn lookup(msg: impl Into<String>) -> Self {
        VaultError::Lookup(msg.into())
    }

    /// Create a column error with a custom message
    pub fn column(msg: impl Into<String>) -> Self {
        VaultError::Column(msg.into())
    }

    /// Create a schema error with a custom message
    pub fn schema(msg: impl Into<String>) -> Self {
        VaultError::Schema(msg.into())
    }

    /// Create a storage error for `path`
    pub fn storage(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        VaultError::Storage {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VaultError::Internal(msg.into())
    }

    /// Failure category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Lookup(_) => ErrorKind::Lookup,
            VaultError::Column(_) | VaultError::Schema(_) => ErrorKind::Schema,
            VaultError::Io(_)
            | VaultError::WalkDir(_)
            | VaultError::Storage { .. }
            | VaultError::PathConversion(_) => ErrorKind::Storage,
            VaultError::Integrity { .. } => ErrorKind::Integrity,
            VaultError::Sqlite(_)
            | VaultError::StatementFailed { .. }
            | VaultError::TransactionState(_)
            | VaultError::LockTimeout => ErrorKind::Database,
            VaultError::StorageNotInitialized(_)
            | VaultError::InvalidConfiguration(_)
            | VaultError::Json(_) => ErrorKind::Configuration,
            VaultError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Only contention errors qualify; the core never retries on its own.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VaultError::LockTimeout => true,
            VaultError::Sqlite(e) | VaultError::StatementFailed { source: e, .. } => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Check if this error indicates corrupted stored content
    pub fn is_integrity(&self) -> bool {
        matches!(self, VaultError::Integrity { .. })
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VaultError::StorageNotInitialized(path) => {
                format!("Storage not initialized at {:?}. Run 'labvault init' first.", path)
            }
            VaultError::LockTimeout => {
                "Operation timed out waiting for the database lock. Another operation may be in progress. Try again later.".to_string()
            }
            VaultError::Integrity { path, .. } => {
                format!(
                    "File {:?} no longer matches its recorded checksum. Restore it from a backup before using it.",
                    path
                )
            }
            VaultError::StatementFailed { index, source, .. } => {
                format!(
                    "Statement #{} of the transaction failed ({}). Nothing was written.",
                    index, source
                )
            }
            _ => self.to_string(),
        }
    }
}
