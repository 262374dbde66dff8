use std::cell::{Ref, RefCell};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::connection::DbConnection;
use crate::error::StorageError;

/// The writer connection and the named lock guarding it.
///
/// The lock is reentrant on its holding thread so composite operations
/// (bulk load, shutdown, a write inside a write) can nest acquisitions.
/// Each acquisition records a reason; a timed-out waiter reports the
/// holder's reason in its error. The writer slot lives inside the lock
/// so bulk load can swap the connection while holding it.
pub(crate) struct WriteLock {
    slot: ReentrantMutex<RefCell<Option<DbConnection>>>,
    reason: Mutex<Option<String>>,
    timeout: Duration,
}

impl WriteLock {
    pub(crate) fn new(writer: DbConnection, timeout: Duration) -> Self {
        Self {
            slot: ReentrantMutex::new(RefCell::new(Some(writer))),
            reason: Mutex::new(None),
            timeout,
        }
    }

    /// Acquire the lock, blocking up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::WriteLockTimeout`] carrying the
    /// current holder's reason.
    pub(crate) fn acquire(&self, reason: &str) -> Result<WriteGuard<'_>, StorageError> {
        match self.slot.try_lock_for(self.timeout) {
            Some(guard) => {
                let previous = self.reason.lock().replace(reason.to_owned());
                Ok(WriteGuard {
                    guard,
                    lock: self,
                    previous,
                })
            }
            None => {
                let held_by = self
                    .reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown".to_owned());
                Err(StorageError::WriteLockTimeout {
                    waited: self.timeout,
                    held_by,
                })
            }
        }
    }

    /// The reason recorded by the current holder, if the lock is held.
    pub(crate) fn current_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Holder of the write lock; dereference through
/// [`WriteGuard::connection`] to reach the writer.
pub(crate) struct WriteGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<Option<DbConnection>>>,
    lock: &'a WriteLock,
    previous: Option<String>,
}

impl WriteGuard<'_> {
    /// Borrow the writer connection.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Disposed`] when the slot was emptied
    /// by shutdown.
    pub(crate) fn connection(&self) -> Result<Ref<'_, DbConnection>, StorageError> {
        Ref::filter_map(self.guard.borrow(), Option::as_ref).map_err(|_| StorageError::Disposed)
    }

    /// Run `action` against the writer.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Disposed`] when the slot is empty,
    /// otherwise whatever `action` fails with.
    pub(crate) fn with<R>(
        &self,
        action: impl FnOnce(&DbConnection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let connection = self.connection()?;
        action(&connection)
    }

    /// Swap the writer slot, returning the previous occupant. Used by
    /// bulk load and shutdown.
    pub(crate) fn replace(&self, connection: Option<DbConnection>) -> Option<DbConnection> {
        self.guard.replace(connection)
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        *self.lock.reason.lock() = self.previous.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn lock() -> WriteLock {
        let conn = DbConnection::open(ConnectionConfig::in_memory()).unwrap();
        WriteLock::new(conn, Duration::from_millis(50))
    }

    #[test]
    fn reentrant_acquisition_on_one_thread() {
        let lock = lock();
        let outer = lock.acquire("outer").unwrap();
        let inner = lock.acquire("inner").unwrap();
        assert_eq!(lock.current_reason().as_deref(), Some("inner"));
        drop(inner);
        assert_eq!(lock.current_reason().as_deref(), Some("outer"));
        drop(outer);
        assert_eq!(lock.current_reason(), None);
    }

    #[test]
    fn timeout_reports_the_holding_reason() {
        let lock = std::sync::Arc::new(lock());
        let held = lock.acquire("long import").unwrap();
        let contender = std::sync::Arc::clone(&lock);
        let result = std::thread::spawn(move || contender.acquire("query").map(|_| ()))
            .join()
            .unwrap();
        match result {
            Err(StorageError::WriteLockTimeout { held_by, .. }) => {
                assert_eq!(held_by, "long import");
            }
            other => panic!("expected a write-lock timeout, got {other:?}"),
        }
        drop(held);
    }
}
