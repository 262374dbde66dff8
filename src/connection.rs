use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::error::{classify, StorageError};
use crate::mapping::{ColumnMapping, MappingRegistry, TableMapping};
use crate::record::Record;
use crate::schema::{self, CreateTableResult};
use crate::transaction::TransactionState;
use crate::value::{FromValue, Value};

/// The engine's default ceiling on bound parameters per statement. The
/// engine can be rebuilt or reconfigured with a different limit at
/// runtime; this crate keeps the stock bound and does not query it.
pub(crate) const MAX_BOUND_PARAMETERS: usize = 999;

/// Batched multi-row INSERT...VALUES needs engine 3.7.11.
const MULTI_VALUES_VERSION: i32 = 3_007_011;

const STATEMENT_CACHE_CAPACITY: usize = 128;

/// Conflict clause applied to an INSERT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conflict {
    /// Plain INSERT; constraint violations fail the statement.
    #[default]
    Abort,
    /// `INSERT OR REPLACE`; writes every column, including the
    /// auto-increment key.
    Replace,
    /// `INSERT OR IGNORE`; conflicting rows are skipped silently.
    Ignore,
}

impl Conflict {
    fn sql_fragment(self) -> &'static str {
        match self {
            Conflict::Abort => "",
            Conflict::Replace => "or replace ",
            Conflict::Ignore => "or ignore ",
        }
    }
}

/// What a [`TableChanged`] event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// Emitted after a successful modification, on the thread that executed
/// it, before any surrounding lock is released.
#[derive(Debug, Clone)]
pub struct TableChanged {
    pub table: String,
    pub action: ChangeAction,
    pub rows: usize,
}

type ChangeSubscriber = Box<dyn Fn(&TableChanged) + Send>;

/// One database connection: the engine handle, its statement cache, the
/// savepoint state machine, and the record-level verbs.
///
/// A connection is not `Sync`; concurrent use goes through the
/// connection manager, which serializes the writer under its lock and
/// lends readers out one holder at a time.
pub struct DbConnection {
    raw: rusqlite::Connection,
    config: ConnectionConfig,
    pub(crate) tx: TransactionState,
    changed: Mutex<Vec<ChangeSubscriber>>,
}

impl DbConnection {
    /// Open a connection with the given options.
    ///
    /// # Errors
    ///
    /// Fails when the engine cannot open the path with the configured
    /// flags.
    pub fn open(config: ConnectionConfig) -> Result<Self, StorageError> {
        let raw = rusqlite::Connection::open_with_flags(&config.path, config.open_flags)
            .map_err(|e| classify(e, None, None))?;
        Self::from_parts(raw, config)
    }

    /// Open a private in-memory database with default options.
    ///
    /// # Errors
    ///
    /// Fails when the engine cannot create the database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(ConnectionConfig::in_memory())
    }

    pub(crate) fn from_parts(
        raw: rusqlite::Connection,
        config: ConnectionConfig,
    ) -> Result<Self, StorageError> {
        raw.busy_timeout(config.busy_timeout)
            .map_err(|e| classify(e, None, None))?;
        raw.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        Ok(Self {
            raw,
            config,
            tx: TransactionState::default(),
            changed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn raw(&self) -> &rusqlite::Connection {
        &self.raw
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &MappingRegistry {
        self.config
            .registry
            .as_deref()
            .unwrap_or_else(|| MappingRegistry::global())
    }

    /// Whether this database is in-memory: the engine reports an empty
    /// database filename, or the configured path asks for memory.
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.raw.path().map_or(true, |p| p.is_empty())
            || self.config.path == ":memory:"
            || self.config.path.contains("mode=memory")
    }

    /// The rowid of the most recent successful INSERT on this connection.
    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.raw.last_insert_rowid()
    }

    /// Rows changed by the most recent statement.
    #[must_use]
    pub fn changes(&self) -> u64 {
        self.raw.changes()
    }

    /// Flush the statement cache and close the engine handle.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's close failure; the handle is still released
    /// by the driver on drop.
    pub fn close(self) -> Result<(), StorageError> {
        self.raw.flush_prepared_statement_cache();
        self.raw.close().map_err(|(_, e)| classify(e, None, None))
    }

    /// Build a command for this connection.
    #[must_use]
    pub fn create_command(&self, sql: impl Into<String>, params: Vec<Value>) -> Command<'_> {
        Command::new(self, sql.into(), params)
    }

    /// Execute a parameterized statement and return rows changed.
    ///
    /// # Errors
    ///
    /// See [`Command::execute_non_query`].
    pub fn execute(&self, sql: &str, params: Vec<Value>) -> Result<usize, StorageError> {
        self.create_command(sql, params).execute_non_query()
    }

    /// Execute a parameterized query and materialize the rows into
    /// records.
    ///
    /// # Errors
    ///
    /// See [`Command::query`].
    pub fn query_records<T: Record>(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<T>, StorageError> {
        self.create_command(sql, params).query::<T>()
    }

    /// Execute a parameterized query and convert the first column of the
    /// first row.
    ///
    /// # Errors
    ///
    /// See [`Command::execute_scalar`].
    pub fn query_scalar<T: FromValue>(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<T, StorageError> {
        self.create_command(sql, params).execute_scalar::<T>()
    }

    /// Execute one or more semicolon-separated statements without
    /// parameters. Suitable for DDL and PRAGMAs.
    ///
    /// # Errors
    ///
    /// Surfaces the first failing statement with its SQL attached.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        self.raw
            .execute_batch(sql)
            .map_err(|e| classify(e, Some(sql), None))
    }

    /// Create or migrate the table for `T` and synthesize its indexes.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor is invalid or the initial CREATE cannot
    /// run; ALTER and index failures report through the result variants.
    pub fn create_table<T: Record>(&self) -> Result<CreateTableResult, StorageError> {
        let mapping = self.registry().get::<T>()?;
        schema::create_table(self, &mapping)
    }

    /// Check the live schema against the descriptor for `T`.
    ///
    /// # Errors
    ///
    /// Fails with a description of the first mismatch.
    pub fn verify_table<T: Record>(&self) -> Result<(), StorageError> {
        let mapping = self.registry().get::<T>()?;
        schema::verify_table(self, &mapping)
    }

    /// Subscribe to modification events on this connection.
    pub fn on_table_changed(&self, subscriber: impl Fn(&TableChanged) + Send + 'static) {
        self.changed.lock().push(Box::new(subscriber));
    }

    fn emit_changed(&self, mapping: &TableMapping, action: ChangeAction, rows: usize) {
        let subscribers = self.changed.lock();
        if subscribers.is_empty() {
            return;
        }
        let event = TableChanged {
            table: mapping.table_name().to_owned(),
            action,
            rows,
        };
        for subscriber in subscribers.iter() {
            subscriber(&event);
        }
    }

    pub(crate) fn emit_trace(&self, line: &str) {
        if let Some(tracer) = &self.config.tracer {
            tracer(line);
        } else {
            tracing::debug!(target: "sqlite_records::trace", "{line}");
        }
    }

    pub(crate) fn wal_checkpoint_restart(&self) -> Result<(), StorageError> {
        let sql = "PRAGMA wal_checkpoint(RESTART)";
        self.raw
            .query_row(sql, [], |_row| Ok(()))
            .map_err(|e| classify(e, Some(sql), None))
    }

    // ---- record verbs -------------------------------------------------

    /// Insert a record. A nil auto-GUID key is generated before binding;
    /// an auto-increment key is written back from the engine afterwards.
    /// Returns rows inserted.
    ///
    /// # Errors
    ///
    /// Constraint violations surface with the offending SQL and, when
    /// inferable, the offending column.
    pub fn insert<T: Record>(&self, record: &mut T) -> Result<usize, StorageError> {
        self.insert_with(record, Conflict::Abort)
    }

    /// Insert, replacing any row with the same key.
    ///
    /// # Errors
    ///
    /// See [`DbConnection::insert`].
    pub fn insert_or_replace<T: Record>(&self, record: &mut T) -> Result<usize, StorageError> {
        self.insert_with(record, Conflict::Replace)
    }

    /// Insert with an explicit conflict clause.
    ///
    /// # Errors
    ///
    /// See [`DbConnection::insert`].
    pub fn insert_with<T: Record>(
        &self,
        record: &mut T,
        conflict: Conflict,
    ) -> Result<usize, StorageError> {
        let mapping = self.registry().get::<T>()?;
        self.prime_auto_guid(record, &mapping)?;
        let columns = mapping.insert_columns(conflict == Conflict::Replace);
        let sql = insert_sql(&mapping, conflict, &columns);
        let params = columns
            .iter()
            .map(|column| record.column_value(&column.member))
            .collect::<Result<Vec<_>, _>>()?;
        let count = self
            .create_command(sql, params)
            .with_mapping(Arc::clone(&mapping))
            .execute_non_query()?;
        if let Some(pk) = mapping.auto_increment_pk() {
            record.set_column_value(&pk.member, Value::Integer(self.raw.last_insert_rowid()))?;
        }
        if count > 0 {
            self.emit_changed(&mapping, ChangeAction::Insert, count);
        }
        Ok(count)
    }

    /// Insert a batch. Wraps the whole call in a savepoint when
    /// `run_in_transaction` is set, so a failing row unwinds the batch.
    /// Returns total rows inserted.
    ///
    /// # Errors
    ///
    /// The first failing statement aborts the batch; with the savepoint
    /// wrap, nothing from the batch persists.
    pub fn insert_all<T: Record>(
        &self,
        records: &mut [T],
        run_in_transaction: bool,
    ) -> Result<usize, StorageError> {
        self.insert_all_with(records, Conflict::Abort, run_in_transaction)
    }

    /// Batch insert with an explicit conflict clause.
    ///
    /// Uses multi-row `INSERT ... VALUES (...), (...)` when the engine
    /// supports it (3.7.11) and one row's parameters fit under the
    /// engine's statement limit; falls back to per-row inserts otherwise.
    ///
    /// # Errors
    ///
    /// See [`DbConnection::insert_all`].
    pub fn insert_all_with<T: Record>(
        &self,
        records: &mut [T],
        conflict: Conflict,
        run_in_transaction: bool,
    ) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        if run_in_transaction {
            self.run_in_transaction(|| self.insert_all_inner(records, conflict))
        } else {
            self.insert_all_inner(records, conflict)
        }
    }

    fn insert_all_inner<T: Record>(
        &self,
        records: &mut [T],
        conflict: Conflict,
    ) -> Result<usize, StorageError> {
        let mapping = self.registry().get::<T>()?;
        let columns = mapping.insert_columns(conflict == Conflict::Replace);
        let per_row = columns.len();
        let batched = rusqlite::version_number() >= MULTI_VALUES_VERSION
            && per_row > 0
            && per_row <= MAX_BOUND_PARAMETERS;
        if !batched {
            let mut total = 0;
            for record in records.iter_mut() {
                total += self.insert_with(record, conflict)?;
            }
            return Ok(total);
        }

        let rows_per_batch = MAX_BOUND_PARAMETERS / per_row;
        let names = column_name_list(&columns);
        let row_marks = format!("({})", vec!["?"; per_row].join(", "));
        let mut total = 0;
        for chunk in records.chunks_mut(rows_per_batch) {
            for record in chunk.iter_mut() {
                self.prime_auto_guid(record, &mapping)?;
            }
            let values = vec![row_marks.as_str(); chunk.len()].join(", ");
            let sql = format!(
                "insert {}into \"{}\" ({names}) values {values}",
                conflict.sql_fragment(),
                mapping.table_name()
            );
            let mut params = Vec::with_capacity(chunk.len() * per_row);
            for record in chunk.iter() {
                for column in &columns {
                    params.push(record.column_value(&column.member)?);
                }
            }
            let count = self
                .create_command(sql, params)
                .with_mapping(Arc::clone(&mapping))
                .execute_non_query()?;
            total += count;
            if count > 0 {
                self.emit_changed(&mapping, ChangeAction::Insert, count);
            }
        }
        Ok(total)
    }

    /// Update the row matching the record's primary key.
    ///
    /// # Errors
    ///
    /// Fails with an unsupported-operation error when the mapping has no
    /// primary key.
    pub fn update<T: Record>(&self, record: &T) -> Result<usize, StorageError> {
        self.update_by(record, None)
    }

    /// Update keyed by the named column instead of the primary key. The
    /// column must be unique.
    ///
    /// # Errors
    ///
    /// Fails when the column is unknown or not unique.
    pub fn update_by<T: Record>(
        &self,
        record: &T,
        update_key: Option<&str>,
    ) -> Result<usize, StorageError> {
        let mapping = self.registry().get::<T>()?;
        let key = match update_key {
            None => mapping.pk().ok_or_else(|| {
                StorageError::UnsupportedOperation(format!(
                    "cannot update {:?}: no primary key",
                    mapping.table_name()
                ))
            })?,
            Some(name) => {
                let column = mapping.column_by_name(name).ok_or_else(|| {
                    StorageError::InvalidArgument(format!(
                        "{:?} has no column named {name:?}",
                        mapping.table_name()
                    ))
                })?;
                if !column.is_unique {
                    return Err(StorageError::UnsupportedOperation(format!(
                        "cannot update {:?} keyed by non-unique column {name:?}",
                        mapping.table_name()
                    )));
                }
                column
            }
        };

        let mut columns: Vec<&ColumnMapping> = mapping
            .columns()
            .iter()
            .filter(|column| column.name != key.name)
            .collect();
        if columns.is_empty() {
            // No non-key column to write: update every column keyed by
            // the key. A no-op, but legal.
            columns = mapping.columns().iter().collect();
        }

        let assignments = columns
            .iter()
            .map(|column| format!("\"{}\" = ?", column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "update \"{}\" set {assignments} where \"{}\" = ?",
            mapping.table_name(),
            key.name
        );
        let mut params = columns
            .iter()
            .map(|column| record.column_value(&column.member))
            .collect::<Result<Vec<_>, _>>()?;
        params.push(record.column_value(&key.member)?);

        let count = self
            .create_command(sql, params)
            .with_mapping(Arc::clone(&mapping))
            .execute_non_query()?;
        if count > 0 {
            self.emit_changed(&mapping, ChangeAction::Update, count);
        }
        Ok(count)
    }

    /// Update each record in turn, inside one savepoint when
    /// `run_in_transaction` is set.
    ///
    /// # Errors
    ///
    /// The first failing update aborts the loop.
    pub fn update_all<T: Record>(
        &self,
        records: &[T],
        run_in_transaction: bool,
    ) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let loop_all = || -> Result<usize, StorageError> {
            let mut total = 0;
            for record in records {
                total += self.update(record)?;
            }
            Ok(total)
        };
        if run_in_transaction {
            self.run_in_transaction(loop_all)
        } else {
            loop_all()
        }
    }

    /// Delete the row matching the record's primary key.
    ///
    /// # Errors
    ///
    /// Fails with an unsupported-operation error when the mapping has no
    /// primary key.
    pub fn delete<T: Record>(&self, record: &T) -> Result<usize, StorageError> {
        let mapping = self.registry().get::<T>()?;
        let pk = mapping.pk().ok_or_else(|| {
            StorageError::UnsupportedOperation(format!(
                "cannot delete from {:?}: no primary key",
                mapping.table_name()
            ))
        })?;
        let key = record.column_value(&pk.member)?;
        self.delete_by_key::<T, _>(key)
    }

    /// Delete the row with the given primary key value.
    ///
    /// # Errors
    ///
    /// See [`DbConnection::delete`].
    pub fn delete_by_key<T: Record, K: Into<Value>>(&self, key: K) -> Result<usize, StorageError> {
        let mapping = self.registry().get::<T>()?;
        let pk = mapping.pk().ok_or_else(|| {
            StorageError::UnsupportedOperation(format!(
                "cannot delete from {:?}: no primary key",
                mapping.table_name()
            ))
        })?;
        let sql = format!(
            "delete from \"{}\" where \"{}\" = ?",
            mapping.table_name(),
            pk.name
        );
        let count = self
            .create_command(sql, vec![key.into()])
            .with_mapping(Arc::clone(&mapping))
            .execute_non_query()?;
        if count > 0 {
            self.emit_changed(&mapping, ChangeAction::Delete, count);
        }
        Ok(count)
    }

    /// Delete every row of the table.
    ///
    /// # Errors
    ///
    /// Surfaces the engine failure, if any.
    pub fn delete_all<T: Record>(&self) -> Result<usize, StorageError> {
        let mapping = self.registry().get::<T>()?;
        let sql = format!("delete from \"{}\"", mapping.table_name());
        let count = self
            .create_command(sql, Vec::new())
            .with_mapping(Arc::clone(&mapping))
            .execute_non_query()?;
        if count > 0 {
            self.emit_changed(&mapping, ChangeAction::Delete, count);
        }
        Ok(count)
    }

    /// Fetch the record with the given primary key.
    ///
    /// # Errors
    ///
    /// Fails with a not-found error when no row matches.
    pub fn get<T: Record, K: Into<Value>>(&self, key: K) -> Result<T, StorageError> {
        let mapping = self.registry().get::<T>()?;
        self.find(key)?.ok_or_else(|| StorageError::NotFound {
            table: mapping.table_name().to_owned(),
        })
    }

    /// Fetch the record with the given primary key, or `None`.
    ///
    /// # Errors
    ///
    /// Fails when the mapping has no primary key or the query fails.
    pub fn find<T: Record, K: Into<Value>>(&self, key: K) -> Result<Option<T>, StorageError> {
        let mapping = self.registry().get::<T>()?;
        let sql = mapping
            .get_by_primary_key_sql()
            .ok_or_else(|| {
                StorageError::UnsupportedOperation(format!(
                    "cannot look up {:?} by key: no primary key",
                    mapping.table_name()
                ))
            })?
            .to_owned();
        let mut rows = self
            .create_command(sql, vec![key.into()])
            .with_mapping(Arc::clone(&mapping))
            .query::<T>()?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }

    fn prime_auto_guid<T: Record>(
        &self,
        record: &mut T,
        mapping: &TableMapping,
    ) -> Result<(), StorageError> {
        let Some(pk) = mapping.pk() else {
            return Ok(());
        };
        if !pk.is_auto_guid {
            return Ok(());
        }
        let current = record.column_value(&pk.member)?;
        let needs_key = match current {
            Value::Null => true,
            Value::Uuid(uuid) => uuid.is_nil(),
            _ => false,
        };
        if needs_key {
            record.set_column_value(&pk.member, Value::Uuid(Uuid::new_v4()))?;
        }
        Ok(())
    }
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnection")
            .field("path", &self.config.path)
            .field("in_transaction", &self.is_in_transaction())
            .finish_non_exhaustive()
    }
}

fn column_name_list(columns: &[&ColumnMapping]) -> String {
    columns
        .iter()
        .map(|column| format!("\"{}\"", column.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_sql(mapping: &TableMapping, conflict: Conflict, columns: &[&ColumnMapping]) -> String {
    if columns.is_empty() {
        return format!(
            "insert {}into \"{}\" default values",
            conflict.sql_fragment(),
            mapping.table_name()
        );
    }
    format!(
        "insert {}into \"{}\" ({}) values ({})",
        conflict.sql_fragment(),
        mapping.table_name(),
        column_name_list(columns),
        vec!["?"; columns.len()].join(", ")
    )
}
