/*!
 * sqlite-records - typed record storage over SQLite
 *
 * This crate maps plain Rust types to SQLite tables through explicit
 * descriptors: a record declares its table once, and the crate
 * synthesizes the schema, caches compiled statements, runs nested
 * savepoint transactions, and manages a single writer plus a bounded
 * reader pool behind a named lock.
 *
 * # Features
 *
 * - Descriptor-driven `CREATE TABLE` / `ALTER TABLE` / index synthesis
 *   with post-migration verification
 * - Record verbs (`insert`, `update`, `delete`, `get`, batched
 *   `insert_all`) over a cached-statement command pipeline
 * - Nested savepoints with commit-failure recovery
 * - One writer under a reentrant named lock plus a bounded reader pool,
 *   with jittered retry around transient engine errors
 * - Typed constraint errors carrying the offending SQL and column
 *
 * # Example
 *
 * ```rust,no_run
 * use sqlite_records::prelude::*;
 *
 * #[derive(Default)]
 * struct Person {
 *     id: i64,
 *     name: String,
 * }
 *
 * impl Record for Person {
 *     fn table() -> TableDescriptor {
 *         TableBuilder::new("Person")
 *             .column(ColumnBuilder::new("id", ColumnKind::BigInteger)
 *                 .primary_key()
 *                 .auto_increment())
 *             .column(ColumnBuilder::new("name", ColumnKind::Text).not_null())
 *             .build()
 *     }
 *
 *     fn column_value(&self, member: &str) -> Result<Value, StorageError> {
 *         match member {
 *             "id" => Ok(self.id.into()),
 *             "name" => Ok(self.name.clone().into()),
 *             other => Err(StorageError::unknown_member::<Self>(other)),
 *         }
 *     }
 *
 *     fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
 *         match member {
 *             "id" => self.id = value.as_integer().unwrap_or_default(),
 *             "name" => self.name = value.as_text().unwrap_or_default().to_owned(),
 *             other => return Err(StorageError::unknown_member::<Self>(other)),
 *         }
 *         Ok(())
 *     }
 * }
 *
 * fn main() -> Result<(), StorageError> {
 *     let manager = ConnectionManager::open(ManagerConfig::new(
 *         ConnectionConfig::new("people.db"),
 *     ))?;
 *
 *     manager.write("create tables", |conn| {
 *         conn.create_table::<Person>().map(|_| ())
 *     })?;
 *
 *     manager.write("insert person", |conn| {
 *         let mut person = Person { id: 0, name: "alice".into() };
 *         conn.insert(&mut person)?;
 *         Ok(())
 *     })?;
 *
 *     let people: Vec<Person> = manager.read(|conn| {
 *         conn.query_records("select * from \"Person\"", Vec::new())
 *     })?;
 *     assert_eq!(people.len(), 1);
 *     Ok(())
 * }
 * ```
 */

#![forbid(unsafe_code)]

// Re-export everything that should be part of the public API
pub mod prelude {
    //! Convenient imports for common functionality.
    //!
    //! This module re-exports the most commonly used types and traits to
    //! make it easier to get started with the library.

    pub use crate::command::{Command, CommandObserver};
    pub use crate::config::{ConnectionConfig, ManagerConfig, OpenFlags};
    pub use crate::connection::{ChangeAction, Conflict, DbConnection, TableChanged};
    pub use crate::error::{ResultCode, StorageError};
    pub use crate::manager::{ConnectionManager, MigrationStep, SchemaMigrations};
    pub use crate::mapping::{
        ColumnBuilder, ColumnKind, CreateFlags, MappingRegistry, TableBuilder, TableDescriptor,
    };
    pub use crate::record::{Record, SqlEnum};
    pub use crate::schema::CreateTableResult;
    pub use crate::value::{FromValue, Value};
}

// Core modules
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod mapping;
pub mod record;
pub mod schema;
pub mod value;

// Private plumbing
mod convert;
mod lock;
mod pool;
mod transaction;

// Direct exports of frequently used types for simplicity
pub use command::{Command, CommandObserver};
pub use config::{ConnectionConfig, ManagerConfig, OpenFlags, TraceSink};
pub use connection::{ChangeAction, Conflict, DbConnection, TableChanged};
pub use error::{ResultCode, StorageError};
pub use manager::{ConnectionManager, MigrationStep, SchemaMigrations};
pub use mapping::{
    ColumnBuilder, ColumnKind, ColumnMapping, CreateFlags, IndexColumn, IndexDescriptor,
    MappingRegistry, TableBuilder, TableDescriptor, TableMapping,
};
pub use pool::ReaderHandle;
pub use record::{Record, SqlEnum};
pub use schema::CreateTableResult;
pub use value::{FromValue, Value};
