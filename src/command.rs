use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use rusqlite::params_from_iter;

use crate::connection::DbConnection;
use crate::convert;
use crate::error::{classify, StorageError};
use crate::mapping::TableMapping;
use crate::record::Record;
use crate::value::{FromValue, Value};

/// Lifecycle hooks around command execution.
///
/// Attached through the connection configuration; every execution calls
/// `execution_started`/`execution_ended`, and queries additionally call
/// `row_created` for each materialized record.
pub trait CommandObserver: Send + Sync {
    fn execution_started(&self, sql: &str) {
        let _ = sql;
    }

    fn execution_ended(&self, sql: &str) {
        let _ = sql;
    }

    fn row_created(&self, row: &dyn Any) {
        let _ = row;
    }
}

/// One parameterized statement bound to a connection.
///
/// The compiled form lives in the connection's statement cache, keyed by
/// the SQL text: the first execution prepares, later executions re-use
/// the compiled statement, and the statement resets when execution
/// finishes. Rows are materialized eagerly and in the order the engine
/// produces them; the borrow on the connection keeps a command from
/// interleaving with another statement on the same connection.
pub struct Command<'conn> {
    conn: &'conn DbConnection,
    sql: String,
    params: Vec<Value>,
    mapping: Option<Arc<TableMapping>>,
}

impl<'conn> Command<'conn> {
    pub(crate) fn new(conn: &'conn DbConnection, sql: String, params: Vec<Value>) -> Self {
        Self {
            conn,
            sql,
            params,
            mapping: None,
        }
    }

    /// Attach the mapping whose columns a constraint failure should be
    /// matched against.
    #[must_use]
    pub(crate) fn with_mapping(mut self, mapping: Arc<TableMapping>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Execute a statement that returns no result rows; a statement that
    /// does produce a row still counts as success. Returns the number of
    /// rows changed.
    ///
    /// # Errors
    ///
    /// Constraint failures surface as the matching [`StorageError`]
    /// variant carrying this command's SQL.
    pub fn execute_non_query(&self) -> Result<usize, StorageError> {
        self.trace("Executing");
        self.observer_started();
        let started = Instant::now();
        let result = self.step_once();
        self.trace_elapsed(started);
        self.observer_ended();
        result
    }

    /// Execute and convert the first column of the first row; the
    /// type's default when the statement produces no row.
    ///
    /// # Errors
    ///
    /// Fails when execution fails or the column does not convert to `T`.
    pub fn execute_scalar<T: FromValue>(&self) -> Result<T, StorageError> {
        self.trace("Executing Query");
        self.observer_started();
        let started = Instant::now();
        let result = self.read_scalar();
        self.trace_elapsed(started);
        self.observer_ended();
        result
    }

    /// Execute and materialize every result row into a record, matching
    /// result columns to descriptor columns by name. Unknown result
    /// columns are skipped.
    ///
    /// # Errors
    ///
    /// Fails when execution fails, a stored value does not convert to
    /// the declared column kind, or the record rejects a member write.
    pub fn query<T: Record>(&self) -> Result<Vec<T>, StorageError> {
        let mapping = self.conn.registry().get::<T>()?;
        self.trace("Executing Query");
        self.observer_started();
        let started = Instant::now();
        let result = self.read_records::<T>(&mapping);
        self.trace_elapsed(started);
        self.observer_ended();
        result
    }

    fn bound_params(&self) -> Result<Vec<rusqlite::types::Value>, StorageError> {
        let ticks = self.conn.config().store_date_time_as_ticks;
        self.params
            .iter()
            .map(|param| convert::bind_value(param, ticks))
            .collect()
    }

    fn classify(&self, err: rusqlite::Error) -> StorageError {
        classify(err, Some(&self.sql), self.mapping.as_deref())
    }

    fn step_once(&self) -> Result<usize, StorageError> {
        let params = self.bound_params()?;
        let mut stmt = self
            .conn
            .raw()
            .prepare_cached(&self.sql)
            .map_err(|e| self.classify(e))?;
        {
            let mut rows = stmt
                .query(params_from_iter(params))
                .map_err(|e| self.classify(e))?;
            let _ = rows.next().map_err(|e| self.classify(e))?;
        }
        drop(stmt);
        usize::try_from(self.conn.raw().changes()).map_err(|e| {
            StorageError::InvalidArgument(format!("affected row count out of range: {e}"))
        })
    }

    fn read_scalar<T: FromValue>(&self) -> Result<T, StorageError> {
        let params = self.bound_params()?;
        let mut stmt = self
            .conn
            .raw()
            .prepare_cached(&self.sql)
            .map_err(|e| self.classify(e))?;
        let mut rows = stmt
            .query(params_from_iter(params))
            .map_err(|e| self.classify(e))?;
        match rows.next().map_err(|e| self.classify(e))? {
            Some(row) => {
                let raw = row.get_ref(0).map_err(|e| self.classify(e))?;
                T::from_value(convert::read_dynamic(raw))
            }
            None => T::from_value(Value::Null),
        }
    }

    fn read_records<T: Record>(&self, mapping: &TableMapping) -> Result<Vec<T>, StorageError> {
        let params = self.bound_params()?;
        let observer = self.conn.config().observer.clone();
        let mut stmt = self
            .conn
            .raw()
            .prepare_cached(&self.sql)
            .map_err(|e| self.classify(e))?;
        let column_names: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|name| (*name).to_owned())
            .collect();
        let targets: Vec<_> = column_names
            .iter()
            .map(|name| mapping.column_by_name(name))
            .collect();

        let mut rows = stmt
            .query(params_from_iter(params))
            .map_err(|e| self.classify(e))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(|e| self.classify(e))? {
            let mut record = T::default();
            for (idx, target) in targets.iter().enumerate() {
                let Some(column) = target else { continue };
                let raw = row.get_ref(idx).map_err(|e| self.classify(e))?;
                let value = convert::read_value(raw, column)?;
                record.set_column_value(&column.member, value)?;
            }
            if let Some(observer) = &observer {
                observer.row_created(&record);
            }
            records.push(record);
        }
        Ok(records)
    }

    fn observer_started(&self) {
        if let Some(observer) = &self.conn.config().observer {
            observer.execution_started(&self.sql);
        }
    }

    fn observer_ended(&self) {
        if let Some(observer) = &self.conn.config().observer {
            observer.execution_ended(&self.sql);
        }
    }

    fn trace(&self, verb: &str) {
        if !self.conn.config().trace {
            return;
        }
        let mut line = format!("{verb}: {}", self.sql);
        for (idx, param) in self.params.iter().enumerate() {
            line.push_str(&format!("\n  {idx}: {param}"));
        }
        self.conn.emit_trace(&line);
    }

    fn trace_elapsed(&self, started: Instant) {
        let config = self.conn.config();
        if !config.trace_time {
            return;
        }
        let elapsed = started.elapsed();
        if elapsed >= config.trace_time_exceeding {
            self.conn.emit_trace(&format!(
                "Database took {} ms to execute: {}",
                elapsed.as_millis(),
                self.sql
            ));
        }
    }
}

impl std::fmt::Display for Command<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql)
    }
}
