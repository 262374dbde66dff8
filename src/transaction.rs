//! Nested-savepoint transaction state machine.
//!
//! Depth is a stack of savepoint names rather than a bare counter: a
//! `BEGIN` pushes a marker, every savepoint pushes its name, and
//! release/rollback-to validate the caller's name against the stack
//! before touching the engine. Savepoint names look like `S<rand>D<depth>`
//! so they stay unique across interleaved scopes.

use parking_lot::Mutex;
use rand::Rng;
use rusqlite::ffi;

use crate::connection::DbConnection;
use crate::error::StorageError;

/// Stack entry marking an explicit `BEGIN TRANSACTION`.
const BEGIN_MARKER: &str = "__begin__";

#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    stack: Mutex<Vec<String>>,
}

/// Failures of BEGIN/SAVEPOINT that can leave a half-open transaction
/// behind; the state machine issues a recovery ROLLBACK for these.
fn needs_failsafe_rollback(err: &StorageError) -> bool {
    err.code().is_some_and(|code| {
        matches!(
            code.primary(),
            ffi::SQLITE_IOERR
                | ffi::SQLITE_FULL
                | ffi::SQLITE_BUSY
                | ffi::SQLITE_NOMEM
                | ffi::SQLITE_INTERRUPT
        )
    })
}

fn parse_savepoint_depth(name: &str) -> Option<usize> {
    let rest = name.strip_prefix('S')?;
    let (random, depth) = rest.split_once('D')?;
    random.parse::<u16>().ok()?;
    depth.parse::<usize>().ok()
}

impl DbConnection {
    /// Whether this connection has an open transaction or savepoint.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    /// Open transaction depth: 1 for a plain `BEGIN`, plus one per open
    /// savepoint.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.tx.stack.lock().len()
    }

    /// Start an explicit transaction. Only valid at depth 0.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::AlreadyInTransaction`] when a
    /// transaction is open; engine failures of the kinds that can leave
    /// a half-open transaction trigger a recovery `ROLLBACK` before
    /// surfacing.
    pub fn begin_transaction(&self) -> Result<(), StorageError> {
        let mut stack = self.tx.stack.lock();
        if !stack.is_empty() {
            return Err(StorageError::AlreadyInTransaction);
        }
        match self.execute_batch("begin transaction") {
            Ok(()) => {
                stack.push(BEGIN_MARKER.to_owned());
                Ok(())
            }
            Err(err) => {
                if needs_failsafe_rollback(&err) {
                    let _ = self.execute_batch("rollback");
                }
                Err(err)
            }
        }
    }

    /// Open a savepoint and return its name. Valid at any depth; at
    /// depth 0 the savepoint itself starts the transaction.
    ///
    /// # Errors
    ///
    /// Engine failures recover the same way as
    /// [`DbConnection::begin_transaction`].
    pub fn save_transaction_point(&self) -> Result<String, StorageError> {
        let mut stack = self.tx.stack.lock();
        let name = format!(
            "S{}D{}",
            rand::thread_rng().gen::<u16>(),
            stack.len()
        );
        match self.execute_batch(&format!("savepoint {name}")) {
            Ok(()) => {
                stack.push(name.clone());
                Ok(name)
            }
            Err(err) => {
                if needs_failsafe_rollback(&err) {
                    let _ = self.execute_batch("rollback");
                    stack.clear();
                }
                Err(err)
            }
        }
    }

    /// Release (commit) the named savepoint and everything nested inside
    /// it.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::BadSavepoint`] for a name that is
    /// malformed or not open on this connection. A busy engine triggers
    /// a best-effort `ROLLBACK` before the failure surfaces.
    pub fn release(&self, name: &str) -> Result<(), StorageError> {
        self.release_inner(name, true)
    }

    pub(crate) fn release_inner(
        &self,
        name: &str,
        rollback_on_failure: bool,
    ) -> Result<(), StorageError> {
        let mut stack = self.tx.stack.lock();
        let position = self.validate_savepoint(&stack, name)?;
        stack.truncate(position);
        match self.execute_batch(&format!("release {name}")) {
            Ok(()) => Ok(()),
            Err(err) => {
                if rollback_on_failure && err.is_retryable() {
                    // The engine can keep the transaction open after a
                    // busy RELEASE; unwind it so the next begin works.
                    let _ = self.execute_batch("rollback");
                    stack.clear();
                }
                Err(err)
            }
        }
    }

    /// Roll back the whole transaction, savepoints included.
    ///
    /// # Errors
    ///
    /// Surfaces the engine failure; depth is reset regardless.
    pub fn rollback(&self) -> Result<(), StorageError> {
        self.rollback_all(false)
    }

    pub(crate) fn rollback_all(&self, no_throw: bool) -> Result<(), StorageError> {
        let mut stack = self.tx.stack.lock();
        let was_open = !stack.is_empty();
        stack.clear();
        if !was_open {
            return Ok(());
        }
        match self.execute_batch("rollback") {
            Ok(()) => Ok(()),
            Err(_) if no_throw => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Roll back to the named savepoint, abandoning everything nested
    /// inside it.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::BadSavepoint`] for a name that is
    /// malformed or not open on this connection.
    pub fn rollback_to(&self, name: &str) -> Result<(), StorageError> {
        let mut stack = self.tx.stack.lock();
        let position = self.validate_savepoint(&stack, name)?;
        stack.truncate(position);
        self.execute_batch(&format!("rollback to {name}"))
    }

    /// Commit the open transaction. A failed COMMIT triggers a
    /// best-effort `ROLLBACK` (the engine can leave the transaction
    /// active after a busy commit) and the original failure surfaces;
    /// depth is 0 afterwards either way.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's commit failure.
    pub fn commit(&self) -> Result<(), StorageError> {
        self.commit_inner(true)
    }

    pub(crate) fn commit_inner(&self, rollback_on_failure: bool) -> Result<(), StorageError> {
        let mut stack = self.tx.stack.lock();
        let was_open = !stack.is_empty();
        stack.clear();
        drop(stack);
        if !was_open {
            return Ok(());
        }
        match self.execute_batch("commit") {
            Ok(()) => Ok(()),
            Err(err) => {
                if rollback_on_failure {
                    let _ = self.execute_batch("rollback");
                }
                Err(err)
            }
        }
    }

    /// Run `action` inside a savepoint: released on success, rolled back
    /// on failure.
    ///
    /// # Errors
    ///
    /// The action's failure is surfaced after the rollback.
    pub fn run_in_transaction<R>(
        &self,
        action: impl FnOnce() -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let savepoint = self.save_transaction_point()?;
        match action() {
            Ok(result) => {
                self.release(&savepoint)?;
                Ok(result)
            }
            Err(err) => {
                let _ = self.rollback_all(true);
                Err(err)
            }
        }
    }

    /// A savepoint name is valid when it parses and is open on this
    /// connection; returns its stack position.
    fn validate_savepoint(&self, stack: &[String], name: &str) -> Result<usize, StorageError> {
        if parse_savepoint_depth(name).is_none() {
            return Err(StorageError::BadSavepoint {
                name: name.to_owned(),
            });
        }
        stack
            .iter()
            .position(|entry| entry == name)
            .ok_or_else(|| StorageError::BadSavepoint {
                name: name.to_owned(),
            })
    }
}
