use std::time::Duration;

use rusqlite::ffi;
use thiserror::Error;

use crate::mapping::TableMapping;

/// SQLite result code pair: the full extended code plus the primary code
/// in its low 8 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode {
    extended: i32,
}

impl ResultCode {
    #[must_use]
    pub fn new(extended: i32) -> Self {
        Self { extended }
    }

    /// The primary result code (low 8 bits of the extended code).
    #[must_use]
    pub fn primary(self) -> i32 {
        self.extended & 0xff
    }

    /// The full extended result code.
    #[must_use]
    pub fn extended(self) -> i32 {
        self.extended
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.extended == self.primary() {
            write!(f, "{}", self.extended)
        } else {
            write!(f, "{}/{}", self.primary(), self.extended)
        }
    }
}

/// Error type for every operation in this crate.
///
/// Constraint failures, transient engine states, and manager-level
/// failures are separate variants so callers can pattern-match instead
/// of parsing messages. Engine-derived variants carry the offending SQL
/// text (when one exists) and the primary/extended result code pair.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Engine error that is none of the more specific kinds below.
    #[error("sqlite error {code}: {message}")]
    Engine {
        code: ResultCode,
        message: String,
        sql: Option<String>,
    },

    /// A UNIQUE (or PRIMARY KEY) constraint rejected the statement.
    #[error("unique constraint violated: {message}")]
    UniqueViolation {
        code: ResultCode,
        message: String,
        sql: Option<String>,
        /// Offending column, when it can be inferred from the engine message.
        column: Option<String>,
    },

    /// A NOT NULL constraint rejected the statement.
    #[error("not-null constraint violated: {message}")]
    NotNullViolation {
        code: ResultCode,
        message: String,
        sql: Option<String>,
        /// Offending column, when it can be inferred from the engine message.
        column: Option<String>,
    },

    /// Any other constraint (check, foreign key, ...) rejected the statement.
    #[error("constraint violated: {message}")]
    ConstraintViolation {
        code: ResultCode,
        message: String,
        sql: Option<String>,
    },

    /// The database is busy or a table is locked. Retryable.
    #[error("database busy: {message}")]
    Transient {
        code: ResultCode,
        message: String,
        sql: Option<String>,
    },

    /// The database file is corrupt or is not a database at all.
    #[error("database corrupt: {message}")]
    Corrupt {
        code: ResultCode,
        message: String,
        sql: Option<String>,
    },

    /// The write lock could not be acquired within the configured timeout.
    #[error("could not acquire the write lock within {waited:?}; held by: {held_by}")]
    WriteLockTimeout { waited: Duration, held_by: String },

    /// The retry loop exhausted its attempts; carries the last cause.
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    /// `begin_transaction` was called while a transaction is open.
    #[error("a transaction is already open on this connection")]
    AlreadyInTransaction,

    /// The savepoint name is malformed or does not belong to the open transaction.
    #[error("invalid savepoint: {name}")]
    BadSavepoint { name: String },

    /// The operation is not valid for this record type (for example,
    /// updating by a non-unique column or deleting without a primary key).
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A value could not be bound to a parameter or read from a column.
    #[error("cannot bind value: {0}")]
    UnsupportedBinding(String),

    /// `get` found no row for the given primary key.
    #[error("no row in {table} for the given primary key")]
    NotFound { table: String },

    /// The connection manager (or pool) has been closed.
    #[error("the connection manager is closed")]
    Disposed,

    /// A caller-supplied argument or descriptor is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    /// Whether the retry loop should try the operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Transient { .. } | StorageError::WriteLockTimeout { .. }
        )
    }

    /// Whether this error means the database file itself is unusable.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupt { .. })
    }

    /// The SQL text the failing statement carried, when any.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        match self {
            StorageError::Engine { sql, .. }
            | StorageError::UniqueViolation { sql, .. }
            | StorageError::NotNullViolation { sql, .. }
            | StorageError::ConstraintViolation { sql, .. }
            | StorageError::Transient { sql, .. }
            | StorageError::Corrupt { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// The engine result code, for engine-derived errors.
    #[must_use]
    pub fn code(&self) -> Option<ResultCode> {
        match self {
            StorageError::Engine { code, .. }
            | StorageError::UniqueViolation { code, .. }
            | StorageError::NotNullViolation { code, .. }
            | StorageError::ConstraintViolation { code, .. }
            | StorageError::Transient { code, .. }
            | StorageError::Corrupt { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The offending column for unique/not-null violations, when inferred.
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match self {
            StorageError::UniqueViolation { column, .. }
            | StorageError::NotNullViolation { column, .. } => column.as_deref(),
            _ => None,
        }
    }
}

/// Classify a driver error into the crate's taxonomy, attaching the SQL
/// text and, for constraint violations, the offending column inferred
/// from the engine message.
pub(crate) fn classify(
    err: rusqlite::Error,
    sql: Option<&str>,
    mapping: Option<&TableMapping>,
) -> StorageError {
    match err {
        rusqlite::Error::SqliteFailure(cause, message) => {
            let code = ResultCode::new(cause.extended_code);
            let message = message.unwrap_or_else(|| cause.to_string());
            classify_code(code, message, sql, mapping)
        }
        other => StorageError::Engine {
            code: ResultCode::new(ffi::SQLITE_ERROR),
            message: other.to_string(),
            sql: sql.map(ToOwned::to_owned),
        },
    }
}

fn classify_code(
    code: ResultCode,
    message: String,
    sql: Option<&str>,
    mapping: Option<&TableMapping>,
) -> StorageError {
    let sql = sql.map(ToOwned::to_owned);
    match code.primary() {
        ffi::SQLITE_CONSTRAINT => match code.extended() {
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                let column = infer_column(&message, mapping);
                StorageError::UniqueViolation {
                    code,
                    message,
                    sql,
                    column,
                }
            }
            ffi::SQLITE_CONSTRAINT_NOTNULL => {
                let column = infer_column(&message, mapping);
                StorageError::NotNullViolation {
                    code,
                    message,
                    sql,
                    column,
                }
            }
            _ => StorageError::ConstraintViolation { code, message, sql },
        },
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => StorageError::Transient { code, message, sql },
        ffi::SQLITE_CORRUPT | ffi::SQLITE_NOTADB => StorageError::Corrupt { code, message, sql },
        _ => StorageError::Engine { code, message, sql },
    }
}

/// Scan the lower-cased engine message for a descriptor column name.
/// The auto-increment primary key is excluded; the engine never names it
/// in a constraint message about user data.
fn infer_column(message: &str, mapping: Option<&TableMapping>) -> Option<String> {
    let mapping = mapping?;
    let lowered = message.to_lowercase();
    mapping
        .columns()
        .iter()
        .filter(|column| !column.is_auto_increment)
        .find(|column| lowered.contains(&column.name.to_lowercase()))
        .map(|column| column.name.clone())
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        classify(err, None, None)
    }
}
