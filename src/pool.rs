use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::connection::DbConnection;
use crate::error::StorageError;

type ReaderOpener = Box<dyn Fn() -> Result<DbConnection, StorageError> + Send + Sync>;

/// Bounded pool of reader connections.
///
/// A checkout prefers the free queue, opens a new reader while below the
/// upper bound, and otherwise waits on the release signal; exhaustion
/// never surfaces to the caller. Dropping the returned handle puts the
/// connection back on the free queue and signals one waiter.
pub(crate) struct ReaderPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    released: Condvar,
    opener: ReaderOpener,
    max_size: usize,
}

struct PoolState {
    free: VecDeque<DbConnection>,
    busy: usize,
    closed: bool,
}

impl ReaderPool {
    /// Build the pool and pre-open `min_size` readers.
    ///
    /// # Errors
    ///
    /// Fails when the bounds are inconsistent or an initial reader
    /// cannot be opened.
    pub(crate) fn new(
        min_size: usize,
        max_size: usize,
        opener: ReaderOpener,
    ) -> Result<Self, StorageError> {
        if min_size < 1 || max_size < min_size {
            return Err(StorageError::InvalidArgument(format!(
                "reader pool bounds {min_size}..{max_size} are invalid"
            )));
        }
        let mut free = VecDeque::with_capacity(min_size);
        for _ in 0..min_size {
            free.push_back(opener()?);
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    free,
                    busy: 0,
                    closed: false,
                }),
                released: Condvar::new(),
                opener,
                max_size,
            }),
        })
    }

    /// Check a reader out, waiting for a release when the pool is at its
    /// bound.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::Disposed`] after the pool is closed,
    /// or when a new reader cannot be opened.
    pub(crate) fn get(&self) -> Result<ReaderHandle, StorageError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(StorageError::Disposed);
            }
            if let Some(connection) = state.free.pop_front() {
                state.busy += 1;
                return Ok(self.handle(connection));
            }
            if state.free.len() + state.busy < self.shared.max_size {
                // Reserve the slot, then open outside the monitor.
                state.busy += 1;
                drop(state);
                match (self.shared.opener)() {
                    Ok(connection) => return Ok(self.handle(connection)),
                    Err(err) => {
                        let mut state = self.shared.state.lock();
                        state.busy -= 1;
                        self.shared.released.notify_one();
                        return Err(err);
                    }
                }
            }
            self.shared.released.wait(&mut state);
        }
    }

    /// Close the free readers now; busy ones drain as their handles
    /// drop.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let free: Vec<DbConnection> = state.free.drain(..).collect();
        drop(state);
        for connection in free {
            if let Err(err) = connection.close() {
                tracing::warn!("closing pooled reader failed: {err}");
            }
        }
        self.shared.released.notify_all();
    }

    /// Free and busy counts, for diagnostics.
    pub(crate) fn counts(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.free.len(), state.busy)
    }

    fn handle(&self, connection: DbConnection) -> ReaderHandle {
        ReaderHandle {
            connection: Some(connection),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A reader checked out of the pool. Dereferences to the connection;
/// dropping it returns the connection and wakes one waiter.
pub struct ReaderHandle {
    connection: Option<DbConnection>,
    shared: Arc<PoolShared>,
}

impl Deref for ReaderHandle {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        self.connection
            .as_ref()
            .expect("reader handle accessed after drop")
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        let connection = self.connection.take();
        let mut state = self.shared.state.lock();
        state.busy = state.busy.saturating_sub(1);
        let closed = state.closed;
        if let Some(connection) = connection {
            if closed {
                drop(state);
                drop(connection);
            } else {
                state.free.push_back(connection);
                drop(state);
            }
        } else {
            drop(state);
        }
        self.shared.released.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use std::time::Duration;

    fn pool(min: usize, max: usize) -> ReaderPool {
        ReaderPool::new(
            min,
            max,
            Box::new(|| DbConnection::open(ConnectionConfig::in_memory())),
        )
        .unwrap()
    }

    #[test]
    fn bounds_are_validated() {
        let opener: ReaderOpener = Box::new(|| DbConnection::open(ConnectionConfig::in_memory()));
        assert!(ReaderPool::new(0, 4, opener).is_err());
    }

    #[test]
    fn checkout_prefers_the_free_queue() {
        let pool = pool(1, 2);
        assert_eq!(pool.counts(), (1, 0));
        let reader = pool.get().unwrap();
        assert_eq!(pool.counts(), (0, 1));
        drop(reader);
        assert_eq!(pool.counts(), (1, 0));
    }

    #[test]
    fn exhausted_pool_waits_for_a_release() {
        let pool = Arc::new(pool(1, 1));
        let held = pool.get().unwrap();
        let waiter = Arc::clone(&pool);
        let join = std::thread::spawn(move || waiter.get().map(|handle| drop(handle)));
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        join.join().unwrap().unwrap();
    }
}
