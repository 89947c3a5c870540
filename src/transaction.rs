//! Multi-statement atomic transactions with compensating side effects
//!
//! A [`Transaction`] queues SQL statements and filesystem hooks and runs them
//! as one indivisible unit:
//!
//! - [`Transaction::add`] / [`Transaction::add_many`] enqueue statements; no
//!   store I/O happens until [`Transaction::execute`] flushes the queue, in
//!   submission order, inside one underlying store transaction.
//! - Post-commit hooks run only after the store commit succeeded, in
//!   registration order. They are used for physical deletions, so a file is
//!   never removed while the delete of its row could still be undone.
//! - Post-rollback hooks run only on rollback, in **reverse** registration
//!   order, so the most recent side effect is undone first.
//!
//! ## Lifecycle
//!
//! `Closed -> Open -> {Committing, RollingBack} -> Closed`. Operations enter
//! the context through [`Transaction::scope`], which is reentrant: nested
//! scopes share the queue and hook lists, and only the outermost exit commits
//! (closure returned `Ok`) or rolls back (closure returned `Err`). The object
//! is reusable once it is closed again.
//!
//! ## Failure semantics
//!
//! A failing statement aborts the whole batch: the store transaction is rolled
//! back, every registered compensation runs, and the error is returned as
//! [`VaultError::StatementFailed`]. No commit hook runs. Hook failures never
//! stop the remaining hooks; they are logged and kept for
//! [`Transaction::take_hook_failures`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use labvault::database::Database;
//! use rusqlite::types::Value;
//!
//! # fn main() -> labvault::Result<()> {
//! let db = Database::open_in_memory()?;
//! let mut tx = db.transaction()?;
//! let ids = tx.scope(|tx| {
//!     tx.add("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", vec![])?;
//!     let idx = tx.index();
//!     tx.add_many(
//!         "INSERT INTO t (v) VALUES (?) RETURNING id",
//!         vec![vec![Value::from("a".to_string())], vec![Value::from("b".to_string())]],
//!     )?;
//!     Ok(tx.execute()?.split_off(idx))
//! })?;
//! assert_eq!(ids.len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::compensation::FsAction;
use crate::error::{Result, VaultError};
use crate::types::HookFailure;
use parking_lot::MutexGuard;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, trace, warn};

/// One row of a result set
pub type Row = Vec<Value>;

/// Rows produced by one executed statement
pub type ResultSet = Vec<Row>;

/// Lifecycle state of a transaction context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not inside any scope
    Closed,
    /// Inside at least one scope
    Open,
    /// Store commit and post-commit hooks in progress
    Committing,
    /// Store rollback and compensations in progress
    RollingBack,
}

#[derive(Debug, Clone)]
struct QueuedStatement {
    sql: String,
    params: Vec<Value>,
}

enum Hook {
    Action(FsAction),
    Func {
        label: String,
        func: Box<dyn FnOnce() -> Result<()>>,
    },
}

impl Hook {
    fn label(&self) -> String {
        match self {
            Hook::Action(action) => action.to_string(),
            Hook::Func { label, .. } => label.clone(),
        }
    }

    fn run(self) -> Result<()> {
        match self {
            Hook::Action(action) => action.run(),
            Hook::Func { func, .. } => func(),
        }
    }
}

/// Transaction context bound to the vault's connection
///
/// Holds the connection lock until dropped. Dropping a context that still has
/// pending work rolls it back.
pub struct Transaction<'db> {
    conn: MutexGuard<'db, Connection>,
    queue: Vec<QueuedStatement>,
    results: Vec<ResultSet>,
    post_commit: Vec<Hook>,
    post_rollback: Vec<Hook>,
    depth: usize,
    status: TransactionStatus,
    begun: bool,
    hook_failures: Vec<HookFailure>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status)
            .field("depth", &self.depth)
            .field("queued", &self.queue.len())
            .field("results", &self.results.len())
            .field("post_commit", &self.post_commit.len())
            .field("post_rollback", &self.post_rollback.len())
            .finish()
    }
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self {
            conn,
            queue: Vec::new(),
            results: Vec::new(),
            post_commit: Vec::new(),
            post_rollback: Vec::new(),
            depth: 0,
            status: TransactionStatus::Closed,
            begun: false,
            hook_failures: Vec::new(),
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Number of scopes currently entered
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run `f` inside the transaction context
    ///
    /// Reentrant. When this is the outermost scope, an `Ok` result commits
    /// (flushing any queued statements and running post-commit hooks) and an
    /// `Err` result rolls back (running compensations in reverse order).
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or the commit error if the outermost
    /// commit fails (in which case the transaction has been rolled back).
    pub fn scope<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.depth += 1;
        if self.depth == 1 {
            trace!("Entering transaction context");
            self.status = TransactionStatus::Open;
        }

        let outcome = f(self);
        self.depth -= 1;
        if self.depth > 0 {
            return outcome;
        }

        match outcome {
            Ok(value) => {
                self.finish_commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!("Transaction scope failed, rolling back: {}", e);
                self.finish_rollback();
                Err(e)
            }
        }
    }

    /// Enqueue one statement
    ///
    /// Nothing reaches the store until [`Transaction::execute`].
    pub fn add(&mut self, sql: impl Into<String>, params: Vec<Value>) -> Result<()> {
        self.ensure_open("add")?;
        self.queue.push(QueuedStatement {
            sql: sql.into(),
            params,
        });
        Ok(())
    }

    /// Enqueue the same statement once per parameter set
    ///
    /// Produces one result set per parameter set when executed.
    pub fn add_many(&mut self, sql: impl Into<String>, param_sets: Vec<Vec<Value>>) -> Result<()> {
        self.ensure_open("add_many")?;
        let sql = sql.into();
        for params in param_sets {
            self.queue.push(QueuedStatement {
                sql: sql.clone(),
                params,
            });
        }
        Ok(())
    }

    /// Index the next enqueued statement's result set will have in
    /// [`Transaction::execute`]'s output
    pub fn index(&self) -> usize {
        self.results.len() + self.queue.len()
    }

    /// Flush queued statements and return every result set produced so far
    /// in the open store transaction
    ///
    /// # Errors
    ///
    /// - [`VaultError::TransactionState`] outside any scope
    /// - [`VaultError::StatementFailed`] if a statement fails; the whole
    ///   transaction has been rolled back when this is returned
    pub fn execute(&mut self) -> Result<Vec<ResultSet>> {
        self.ensure_open("execute")?;
        self.flush()?;
        Ok(self.results.clone())
    }

    /// Flush and return the first value of the first row of the last result
    pub fn execute_fetchlast(&mut self) -> Result<Option<Value>> {
        self.ensure_open("execute_fetchlast")?;
        self.flush()?;
        Ok(self
            .results
            .last()
            .and_then(|rs| rs.first())
            .and_then(|row| row.first())
            .cloned())
    }

    /// Flush and return the last result set
    pub fn execute_fetchindex(&mut self) -> Result<ResultSet> {
        self.ensure_open("execute_fetchindex")?;
        self.flush()?;
        Ok(self.results.last().cloned().unwrap_or_default())
    }

    /// Flush and return the result set at `idx`
    pub fn execute_fetchindex_at(&mut self, idx: usize) -> Result<ResultSet> {
        self.ensure_open("execute_fetchindex_at")?;
        self.flush()?;
        self.results.get(idx).cloned().ok_or_else(|| {
            VaultError::TransactionState(format!(
                "no result set at index {} ({} available)",
                idx,
                self.results.len()
            ))
        })
    }

    /// Flush and return every value of the last result set, row by row
    pub fn execute_fetchflatten(&mut self) -> Result<Vec<Value>> {
        Ok(self.execute_fetchindex()?.into_iter().flatten().collect())
    }

    /// Flush and return every value of the result set at `idx`, row by row
    pub fn execute_fetchflatten_at(&mut self, idx: usize) -> Result<Vec<Value>> {
        Ok(self
            .execute_fetchindex_at(idx)?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Run `action` after the store commit succeeds
    pub fn add_post_commit_action(&mut self, action: FsAction) -> Result<()> {
        self.ensure_open("add_post_commit_action")?;
        self.post_commit.push(Hook::Action(action));
        Ok(())
    }

    /// Run `func` after the store commit succeeds
    pub fn add_post_commit_func<F>(&mut self, label: impl Into<String>, func: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.ensure_open("add_post_commit_func")?;
        self.post_commit.push(Hook::Func {
            label: label.into(),
            func: Box::new(func),
        });
        Ok(())
    }

    /// Run `action` if the transaction rolls back
    pub fn add_post_rollback_action(&mut self, action: FsAction) -> Result<()> {
        self.ensure_open("add_post_rollback_action")?;
        self.post_rollback.push(Hook::Action(action));
        Ok(())
    }

    /// Run `func` if the transaction rolls back
    pub fn add_post_rollback_func<F>(&mut self, label: impl Into<String>, func: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.ensure_open("add_post_rollback_func")?;
        self.post_rollback.push(Hook::Func {
            label: label.into(),
            func: Box::new(func),
        });
        Ok(())
    }

    /// Commit now, without leaving the current scope
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        self.finish_commit()
    }

    /// Roll back now, without leaving the current scope
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        self.finish_rollback();
        Ok(())
    }

    /// Hook failures recorded since the last call
    pub fn take_hook_failures(&mut self) -> Vec<HookFailure> {
        std::mem::take(&mut self.hook_failures)
    }

    /// Run a multi-statement script inside the open store transaction
    pub(crate) fn execute_script(&mut self, sql: &str) -> Result<()> {
        self.ensure_open("execute_script")?;
        self.flush()?;
        self.begin()?;
        if let Err(e) = self.conn.execute_batch(sql) {
            self.finish_rollback();
            return Err(e.into());
        }
        Ok(())
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.depth == 0 {
            return Err(VaultError::TransactionState(format!(
                "{} called outside a transaction scope",
                operation
            )));
        }
        Ok(())
    }

    fn resting_status(&self) -> TransactionStatus {
        if self.depth > 0 {
            TransactionStatus::Open
        } else {
            TransactionStatus::Closed
        }
    }

    fn begin(&mut self) -> Result<()> {
        if !self.begun {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.begun = true;
            trace!("Store transaction started");
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        self.begin()?;

        let queue = std::mem::take(&mut self.queue);
        debug!("Flushing {} queued statements", queue.len());
        for statement in queue {
            match run_statement(&self.conn, &statement) {
                Ok(rows) => self.results.push(rows),
                Err(source) => {
                    let index = self.results.len();
                    warn!("Statement {} failed: {}", index, source);
                    self.finish_rollback();
                    return Err(VaultError::StatementFailed {
                        index,
                        sql: statement.sql,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    fn finish_commit(&mut self) -> Result<()> {
        self.flush()?;
        self.status = TransactionStatus::Committing;
        if self.begun {
            if let Err(e) = self.conn.execute_batch("COMMIT") {
                warn!("Commit failed: {}", e);
                self.finish_rollback();
                return Err(e.into());
            }
            self.begun = false;
        }
        self.results.clear();
        self.post_rollback.clear();

        let hooks = std::mem::take(&mut self.post_commit);
        if !hooks.is_empty() {
            debug!("Running {} post-commit hooks", hooks.len());
        }
        for hook in hooks {
            self.run_hook(hook);
        }
        self.status = self.resting_status();
        Ok(())
    }

    fn finish_rollback(&mut self) {
        self.status = TransactionStatus::RollingBack;
        self.queue.clear();
        self.results.clear();
        self.post_commit.clear();
        if self.begun {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Store rollback failed: {}", e);
            }
            self.begun = false;
        }

        let hooks = std::mem::take(&mut self.post_rollback);
        if !hooks.is_empty() {
            debug!("Running {} compensations", hooks.len());
        }
        for hook in hooks.into_iter().rev() {
            self.run_hook(hook);
        }
        self.status = self.resting_status();
    }

    fn run_hook(&mut self, hook: Hook) {
        let label = hook.label();
        trace!("Running hook: {}", label);
        if let Err(e) = hook.run() {
            warn!("Hook '{}' failed: {}", label, e);
            self.hook_failures.push(HookFailure {
                label,
                message: e.to_string(),
            });
        }
    }

    fn has_pending_work(&self) -> bool {
        self.begun
            || !self.queue.is_empty()
            || !self.post_commit.is_empty()
            || !self.post_rollback.is_empty()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.has_pending_work() {
            warn!("Transaction dropped with pending work, rolling back");
            self.depth = 0;
            self.finish_rollback();
        }
    }
}

fn run_statement(conn: &Connection, statement: &QueuedStatement) -> rusqlite::Result<ResultSet> {
    trace!("Executing: {}", statement.sql);
    let mut stmt = conn.prepare_cached(&statement.sql)?;
    let columns = stmt.column_count();
    if columns == 0 {
        stmt.execute(params_from_iter(statement.params.iter()))?;
        return Ok(Vec::new());
    }

    let mut rows = stmt.query(params_from_iter(statement.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns);
        for i in 0..columns {
            values.push(row.get::<_, Value>(i)?);
        }
        out.push(values);
    }
    Ok(out)
}

/// Read an integer value
pub fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        other => Err(VaultError::internal(format!(
            "expected an integer, found {:?}",
            other
        ))),
    }
}

/// Read a nullable integer value
pub fn as_opt_i64(value: &Value) -> Result<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        other => as_i64(other).map(Some),
    }
}

/// Read a text value
pub fn as_text(value: &Value) -> Result<String> {
    match value {
        Value::Text(s) => Ok(s.clone()),
        other => Err(VaultError::internal(format!(
            "expected text, found {:?}",
            other
        ))),
    }
}

/// Read a boolean stored as 0/1
pub fn as_bool(value: &Value) -> Result<bool> {
    as_i64(value).map(|i| i != 0)
}

/// Value at `idx` of a row
pub fn column(row: &Row, idx: usize) -> Result<&Value> {
    row.get(idx)
        .ok_or_else(|| VaultError::internal(format!("row has no column {}", idx)))
}
