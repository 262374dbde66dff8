//! Single-writer / pooled-reader connection manager.
//!
//! One writer connection lives behind a named reentrant lock; readers
//! come from a bounded pool. Callers go through [`ConnectionManager::write`]
//! and [`ConnectionManager::read`], which retry transient engine errors
//! and write-lock timeouts with jittered backoff. Bootstrap applies the
//! session pragmas, runs schema migrations against `PRAGMA user_version`,
//! and performs WAL checkpoint plus maintenance; a corrupt database file
//! is deleted (with its sidecars) before the failure surfaces.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use rusqlite::backup::{Backup, StepResult};

use crate::config::{ConnectionConfig, ManagerConfig};
use crate::connection::DbConnection;
use crate::error::{classify, StorageError};
use crate::lock::WriteLock;
use crate::pool::ReaderPool;

const WRITE_RETRIES: u32 = 10;
const BACKOFF_MILLIS: std::ops::Range<u64> = 500..5000;

/// Application-defined schema migrations, driven by
/// `PRAGMA user_version`.
///
/// The manager loops from the stored version toward
/// [`SchemaMigrations::latest_version`], calling
/// [`SchemaMigrations::migrate`] once per stored version. Each
/// [`MigrationStep::apply`] call runs its work inside `BEGIN ... COMMIT`
/// and then writes the new version; a migration that does not advance
/// the version fails the bootstrap instead of looping forever.
pub trait SchemaMigrations {
    /// The version an up-to-date database reports.
    fn latest_version(&self) -> i64;

    /// Bring the schema forward from `from`. Call
    /// [`MigrationStep::apply`] with the version the work leads to.
    ///
    /// # Errors
    ///
    /// A failing step aborts the bootstrap.
    fn migrate(&self, from: i64, step: &mut MigrationStep<'_>) -> Result<(), StorageError>;
}

/// Handle a migration uses to run one transactional step.
pub struct MigrationStep<'a> {
    conn: &'a DbConnection,
}

impl MigrationStep<'_> {
    /// The connection the migration runs on, for reads outside the
    /// transactional step.
    #[must_use]
    pub fn connection(&self) -> &DbConnection {
        self.conn
    }

    /// Run `work` inside `BEGIN ... COMMIT` and record `to` as the new
    /// schema version.
    ///
    /// # Errors
    ///
    /// A failing step is rolled back (best effort) and surfaces.
    pub fn apply(
        &mut self,
        to: i64,
        work: impl FnOnce(&DbConnection) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        self.conn.execute_batch("begin transaction")?;
        match work(self.conn) {
            Ok(()) => self.conn.execute_batch("commit")?,
            Err(err) => {
                let _ = self.conn.execute_batch("rollback");
                return Err(err);
            }
        }
        self.conn
            .raw()
            .pragma_update(None, "user_version", to)
            .map_err(|e| classify(e, Some("PRAGMA user_version"), None))
    }
}

/// One writer plus a bounded reader pool over a single database.
pub struct ConnectionManager {
    config: ManagerConfig,
    write_lock: WriteLock,
    readers: ReaderPool,
    in_memory: bool,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Open and bootstrap the database without schema migrations.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::open_with_migrations`].
    pub fn open(config: ManagerConfig) -> Result<Self, StorageError> {
        Self::open_with_migrations(config, None)
    }

    /// Open the database, bootstrap the writer (pragmas, migrations, WAL
    /// checkpoint, maintenance), and start the reader pool.
    ///
    /// # Errors
    ///
    /// A corrupt database file is deleted together with its `-journal`,
    /// `-shm`, `-wal`, and `-mj*` sidecars before the corruption error
    /// surfaces; other failures surface as they are.
    pub fn open_with_migrations(
        config: ManagerConfig,
        migrations: Option<&dyn SchemaMigrations>,
    ) -> Result<Self, StorageError> {
        let writer = match Self::open_writer(&config, migrations) {
            Ok(writer) => writer,
            Err(err) if err.is_corruption() => {
                tracing::error!(
                    "database {:?} is corrupt during bootstrap; deleting it: {err}",
                    config.connection.path
                );
                delete_database_files(&config.connection.path);
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let in_memory = writer.is_in_memory();

        let reader_config = config.connection.clone();
        let readers = ReaderPool::new(
            config.min_pool_size,
            config.max_pool_size,
            Box::new(move || {
                let conn = DbConnection::open(reader_config.clone())?;
                apply_session_pragmas(&conn, &reader_config)?;
                Ok(conn)
            }),
        )?;

        tracing::info!(
            "database {:?} open (in_memory: {in_memory}, pool: {}..{})",
            config.connection.path,
            config.min_pool_size,
            config.max_pool_size
        );
        Ok(Self {
            write_lock: WriteLock::new(writer, config.write_lock_timeout),
            readers,
            in_memory,
            closed: AtomicBool::new(false),
            config,
        })
    }

    fn open_writer(
        config: &ManagerConfig,
        migrations: Option<&dyn SchemaMigrations>,
    ) -> Result<DbConnection, StorageError> {
        let conn = DbConnection::open(config.connection.clone())?;
        apply_session_pragmas(&conn, &config.connection)?;
        if let Some(migrations) = migrations {
            run_migrations(&conn, migrations)?;
        }
        conn.wal_checkpoint_restart()?;
        conn.execute_batch("VACUUM; REINDEX; ANALYZE;")?;
        Ok(conn)
    }

    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Free and busy reader counts, for diagnostics.
    #[must_use]
    pub fn reader_counts(&self) -> (usize, usize) {
        self.readers.counts()
    }

    /// The reason recorded by the current write-lock holder, if held.
    #[must_use]
    pub fn lock_reason(&self) -> Option<String> {
        self.write_lock.current_reason()
    }

    /// Run `action` against the writer under the write lock, retrying
    /// transient failures with jittered backoff.
    ///
    /// # Errors
    ///
    /// Retryable failures escape as retry-exhausted after the attempts
    /// run out; everything else surfaces on first occurrence.
    pub fn write<R>(
        &self,
        reason: &str,
        mut action: impl FnMut(&DbConnection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        self.ensure_open()?;
        self.execute_with_retry(|| {
            let guard = self.write_lock.acquire(reason)?;
            guard.with(|conn| action(conn))
        })
    }

    /// Run `action` against the writer under the write lock, without the
    /// retry loop. A lock timeout surfaces immediately with the holder's
    /// reason.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::write`], minus the retries.
    pub fn write_without_retry<R>(
        &self,
        reason: &str,
        action: impl FnOnce(&DbConnection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        self.ensure_open()?;
        let guard = self.write_lock.acquire(reason)?;
        guard.with(action)
    }

    /// Run `action` against a pooled reader, retrying transient
    /// failures. For an in-memory database the read rides the writer
    /// under the write lock instead; savepoints on a shared-cache
    /// in-memory database misbehave.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::write`].
    pub fn read<R>(
        &self,
        mut action: impl FnMut(&DbConnection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        self.ensure_open()?;
        if self.in_memory {
            self.execute_with_retry(|| {
                let guard = self.write_lock.acquire("read")?;
                guard.with(|conn| action(conn))
            })
        } else {
            self.execute_with_retry(|| {
                let reader = self.readers.get()?;
                action(&reader)
            })
        }
    }

    fn execute_with_retry<R>(
        &self,
        mut attempt: impl FnMut() -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if tries >= WRITE_RETRIES => {
                    return Err(StorageError::RetryExhausted {
                        attempts: tries,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    tracing::warn!("transient database error (attempt {tries}): {err}");
                    let backoff = rand::thread_rng().gen_range(BACKOFF_MILLIS);
                    std::thread::sleep(Duration::from_millis(backoff));
                }
            }
        }
    }

    /// Swap the writer for an in-memory copy of the database, taken via
    /// the engine's online backup. A no-op for a database that is
    /// already in memory.
    ///
    /// # Errors
    ///
    /// Fails when the surrogate cannot be created or the copy fails; the
    /// on-disk writer stays in place in that case.
    pub fn bulk_load_start(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.in_memory {
            return Ok(());
        }
        let guard = self.write_lock.acquire("bulk load start")?;
        let mut surrogate =
            rusqlite::Connection::open_in_memory().map_err(|e| classify(e, None, None))?;
        let page_size: i64 = guard.with(|writer| {
            writer
                .raw()
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(|e| classify(e, Some("PRAGMA page_size"), None))
        })?;
        surrogate
            .pragma_update(None, "page_size", page_size)
            .map_err(|e| classify(e, None, None))?;
        guard.with(|writer| run_backup(writer.raw(), &mut surrogate))?;
        let surrogate = DbConnection::from_parts(surrogate, self.config.connection.clone())?;
        if let Some(previous) = guard.replace(Some(surrogate)) {
            if let Err(err) = previous.close() {
                tracing::warn!("closing the on-disk writer for bulk load failed: {err}");
            }
        }
        tracing::debug!("bulk load started; writer swapped to an in-memory surrogate");
        Ok(())
    }

    /// Copy the in-memory surrogate back to disk and restore an on-disk
    /// writer.
    ///
    /// # Errors
    ///
    /// Fails when the on-disk database cannot be reopened or the copy
    /// back fails.
    pub fn bulk_load_finish(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.in_memory {
            return Ok(());
        }
        let guard = self.write_lock.acquire("bulk load finish")?;
        let mut disk = rusqlite::Connection::open_with_flags(
            &self.config.connection.path,
            self.config.connection.open_flags,
        )
        .map_err(|e| classify(e, None, None))?;
        guard.with(|surrogate| run_backup(surrogate.raw(), &mut disk))?;
        let disk = DbConnection::from_parts(disk, self.config.connection.clone())?;
        apply_session_pragmas(&disk, &self.config.connection)?;
        drop(guard.replace(Some(disk)));
        tracing::debug!("bulk load finished; writer restored to disk");
        Ok(())
    }

    /// Discard the in-memory surrogate and reopen the on-disk writer,
    /// abandoning everything loaded since [`ConnectionManager::bulk_load_start`].
    ///
    /// # Errors
    ///
    /// Fails when the on-disk database cannot be reopened.
    pub fn bulk_load_rollback(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.in_memory {
            return Ok(());
        }
        let guard = self.write_lock.acquire("bulk load rollback")?;
        let disk = DbConnection::open(self.config.connection.clone())?;
        apply_session_pragmas(&disk, &self.config.connection)?;
        drop(guard.replace(Some(disk)));
        tracing::debug!("bulk load rolled back; writer restored to disk");
        Ok(())
    }

    /// Restart-checkpoint the WAL.
    ///
    /// # Errors
    ///
    /// Surfaces the engine failure, if any.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.write_without_retry("checkpoint", DbConnection::wal_checkpoint_restart)
    }

    /// Run `PRAGMA optimize` on the writer.
    ///
    /// # Errors
    ///
    /// Surfaces the engine failure, if any.
    pub fn optimize(&self) -> Result<(), StorageError> {
        self.write_without_retry("optimize", |conn| conn.execute_batch("PRAGMA optimize"))
    }

    /// Copy the live database to `path` via online backup.
    ///
    /// # Errors
    ///
    /// Fails when the destination cannot be opened or the copy fails.
    pub fn backup_to(&self, path: impl AsRef<Path>) -> Result<(), StorageError> {
        self.ensure_open()?;
        let guard = self.write_lock.acquire("backup")?;
        let mut destination =
            rusqlite::Connection::open(path.as_ref()).map_err(|e| classify(e, None, None))?;
        guard.with(|writer| run_backup(writer.raw(), &mut destination))
    }

    /// Shut down: `PRAGMA optimize`, close the reader pool, checkpoint
    /// the WAL, and close the writer. Idempotent.
    ///
    /// # Errors
    ///
    /// Surfaces a writer close failure; maintenance failures are logged
    /// and skipped.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let guard = self.write_lock.acquire("shutdown")?;
        if let Err(err) = guard.with(|conn| conn.execute_batch("PRAGMA optimize")) {
            tracing::warn!("PRAGMA optimize during shutdown failed: {err}");
        }
        self.readers.close();
        if let Err(err) = guard.with(DbConnection::wal_checkpoint_restart) {
            tracing::warn!("WAL checkpoint during shutdown failed: {err}");
        }
        let writer = guard.replace(None);
        drop(guard);
        match writer {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!("closing the connection manager failed: {err}");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("path", &self.config.connection.path)
            .field("in_memory", &self.in_memory)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn apply_session_pragmas(
    conn: &DbConnection,
    config: &ConnectionConfig,
) -> Result<(), StorageError> {
    let raw = conn.raw();
    raw.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| classify(e, Some("PRAGMA synchronous"), None))?;
    // journal_mode answers with the resulting mode, so it cannot go
    // through a plain execute.
    raw.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))
        .map_err(|e| classify(e, Some("PRAGMA journal_mode=WAL"), None))?;
    if let Some(page_size) = config.page_size {
        raw.pragma_update(None, "page_size", i64::from(page_size))
            .map_err(|e| classify(e, Some("PRAGMA page_size"), None))?;
    }
    raw.pragma_update(None, "cache_size", 5000_i64)
        .map_err(|e| classify(e, Some("PRAGMA cache_size"), None))?;
    Ok(())
}

fn run_migrations(
    conn: &DbConnection,
    migrations: &dyn SchemaMigrations,
) -> Result<(), StorageError> {
    let latest = migrations.latest_version();
    let mut current = user_version(conn)?;
    while current < latest {
        tracing::info!("migrating schema: version {current} toward {latest}");
        migrations.migrate(current, &mut MigrationStep { conn })?;
        let next = user_version(conn)?;
        if next <= current {
            return Err(StorageError::InvalidArgument(format!(
                "migration from version {current} did not advance the schema version"
            )));
        }
        current = next;
    }
    Ok(())
}

fn user_version(conn: &DbConnection) -> Result<i64, StorageError> {
    conn.raw()
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| classify(e, Some("PRAGMA user_version"), None))
}

fn run_backup(
    source: &rusqlite::Connection,
    destination: &mut rusqlite::Connection,
) -> Result<(), StorageError> {
    let backup = Backup::new(source, destination).map_err(|e| classify(e, None, None))?;
    loop {
        match backup.step(-1).map_err(|e| classify(e, None, None))? {
            StepResult::Done => return Ok(()),
            StepResult::More => {}
            StepResult::Busy | StepResult::Locked => {
                std::thread::sleep(Duration::from_millis(25));
            }
            _ => {
                std::thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

fn delete_database_files(path: &str) {
    if path == ":memory:" || path.contains("mode=memory") {
        return;
    }
    let base = PathBuf::from(path);
    let _ = std::fs::remove_file(&base);
    for suffix in ["-journal", "-shm", "-wal"] {
        let _ = std::fs::remove_file(PathBuf::from(format!("{path}{suffix}")));
    }
    if let (Some(parent), Some(name)) = (
        base.parent(),
        base.file_name().and_then(|name| name.to_str()),
    ) {
        let master_journal_prefix = format!("{name}-mj");
        if let Ok(entries) = std::fs::read_dir(parent) {
            for entry in entries.flatten() {
                let matches = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|file| file.starts_with(&master_journal_prefix));
                if matches {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}
