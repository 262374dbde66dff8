//! Schema synthesis and reconciliation.
//!
//! `create_table` turns a mapping into `CREATE [VIRTUAL] TABLE`,
//! `ALTER TABLE ADD COLUMN`, and `CREATE [UNIQUE] INDEX` statements and
//! reconciles them against the live schema reported by
//! `PRAGMA table_info` / `index_list` / `index_info`. `verify_table`
//! checks the reconciled schema after the fact.

use std::collections::HashSet;

use crate::connection::DbConnection;
use crate::error::{classify, StorageError};
use crate::mapping::{ColumnMapping, CreateFlags, IndexDescriptor, TableMapping};

/// Outcome of [`DbConnection::create_table`].
///
/// ALTER and index failures report through the two error variants so a
/// caller can tell a fresh table from a partial migration; a failing
/// initial CREATE surfaces as a plain error instead.
#[derive(Debug)]
pub enum CreateTableResult {
    /// The table did not exist and was created.
    Created,
    /// The table existed; missing columns were added.
    Migrated,
    /// The table was created or migrated but an index could not be.
    Error(StorageError),
    /// An `ALTER TABLE ADD COLUMN` failed.
    ErrorMigrating(StorageError),
}

impl CreateTableResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, CreateTableResult::Created | CreateTableResult::Migrated)
    }
}

pub(crate) fn create_table(
    conn: &DbConnection,
    mapping: &TableMapping,
) -> Result<CreateTableResult, StorageError> {
    let ticks = conn.config().store_date_time_as_ticks;
    let existing = table_info(conn, mapping.table_name())?;

    let result = if existing.is_empty() {
        conn.execute_batch(&create_table_sql(mapping, ticks))?;
        CreateTableResult::Created
    } else {
        match migrate_table(conn, mapping, &existing, ticks) {
            Ok(()) => CreateTableResult::Migrated,
            Err(err) => return Ok(CreateTableResult::ErrorMigrating(err)),
        }
    };

    for index in mapping.indices() {
        let sql = create_index_sql(mapping.table_name(), index);
        if let Err(err) = conn.execute_batch(&sql) {
            return Ok(CreateTableResult::Error(err));
        }
    }
    Ok(result)
}

/// Check the live schema against the mapping: every column present with
/// matching key, null, and declared-type facts, every expected index
/// present, and no unexpected index left behind.
pub(crate) fn verify_table(
    conn: &DbConnection,
    mapping: &TableMapping,
) -> Result<(), StorageError> {
    let table = mapping.table_name();
    let ticks = conn.config().store_date_time_as_ticks;

    let live = table_info(conn, table)?;
    if live.is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "table {table:?} does not exist"
        )));
    }
    for column in mapping.columns() {
        let found = live
            .iter()
            .find(|info| info.name.eq_ignore_ascii_case(&column.name))
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "{table}: column {:?} is missing",
                    column.name
                ))
            })?;
        if found.pk != column.is_pk {
            return Err(StorageError::InvalidArgument(format!(
                "{table}.{}: primary-key flag differs from the descriptor",
                column.name
            )));
        }
        if found.not_null != !column.is_nullable {
            return Err(StorageError::InvalidArgument(format!(
                "{table}.{}: not-null flag differs from the descriptor",
                column.name
            )));
        }
        let expected_type = declared_sql_type(column, ticks);
        if !found.declared_type.eq_ignore_ascii_case(&expected_type) {
            return Err(StorageError::InvalidArgument(format!(
                "{table}.{}: declared type {:?} does not match expected {expected_type:?}",
                column.name, found.declared_type
            )));
        }
    }

    let live_indexes = index_list(conn, table)?;
    let named: Vec<&LiveIndex> = live_indexes
        .iter()
        .filter(|index| index.origin != "pk")
        .collect();
    for expected in mapping.indices() {
        let found = named
            .iter()
            .find(|index| index.name == expected.name)
            .ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "{table}: index {:?} is missing",
                    expected.name
                ))
            })?;
        if found.unique != expected.unique {
            return Err(StorageError::InvalidArgument(format!(
                "{table}: index {:?} unique flag differs from the descriptor",
                expected.name
            )));
        }
        let live_columns = index_info(conn, &expected.name)?;
        let matches = live_columns.len() == expected.columns.len()
            && live_columns
                .iter()
                .zip(expected.columns.iter())
                .all(|(live, wanted)| live.eq_ignore_ascii_case(&wanted.name));
        if !matches {
            return Err(StorageError::InvalidArgument(format!(
                "{table}: index {:?} covers {live_columns:?}, descriptor expects different columns",
                expected.name
            )));
        }
    }
    for live_index in named {
        if !mapping
            .indices()
            .iter()
            .any(|expected| expected.name == live_index.name)
        {
            return Err(StorageError::InvalidArgument(format!(
                "{table}: unexpected index {:?}",
                live_index.name
            )));
        }
    }
    Ok(())
}

fn migrate_table(
    conn: &DbConnection,
    mapping: &TableMapping,
    existing: &[TableColumnInfo],
    ticks: bool,
) -> Result<(), StorageError> {
    let have: HashSet<String> = existing
        .iter()
        .map(|info| info.name.to_lowercase())
        .collect();
    for column in mapping.columns() {
        if !have.contains(&column.name.to_lowercase()) {
            let sql = format!(
                "alter table \"{}\" add column {}",
                mapping.table_name(),
                column_decl(column, ticks)
            );
            conn.execute_batch(&sql)?;
        }
    }
    Ok(())
}

/// Declared SQL type for a column. An auto-increment key must be
/// declared exactly `integer`; the engine rejects AUTOINCREMENT on any
/// other type name.
fn declared_sql_type(column: &ColumnMapping, ticks: bool) -> String {
    if column.is_auto_increment {
        "integer".to_owned()
    } else {
        column.kind.declared_type(column.max_length, ticks)
    }
}

fn column_decl(column: &ColumnMapping, ticks: bool) -> String {
    let mut decl = format!(
        "\"{}\" {} ",
        column.name,
        declared_sql_type(column, ticks)
    );
    if column.is_pk {
        decl.push_str("primary key ");
    }
    if column.is_auto_increment {
        decl.push_str("autoincrement ");
    }
    if !column.is_nullable {
        decl.push_str("not null ");
    }
    if let Some(collation) = &column.collation {
        if !collation.is_empty() {
            decl.push_str(&format!("collate {collation} "));
        }
    }
    if let Some(default) = &column.default_value {
        decl.push_str(&format!("default('{default}') "));
    }
    decl.trim_end().to_owned()
}

fn create_table_sql(mapping: &TableMapping, ticks: bool) -> String {
    let decls = mapping
        .columns()
        .iter()
        .map(|column| column_decl(column, ticks))
        .collect::<Vec<_>>()
        .join(", ");
    let flags = mapping.create_flags();
    let fts = if flags.contains(CreateFlags::FULL_TEXT_SEARCH_3) {
        Some("fts3")
    } else if flags.contains(CreateFlags::FULL_TEXT_SEARCH_4) {
        Some("fts4")
    } else {
        None
    };
    match fts {
        Some(using) => format!(
            "create virtual table if not exists \"{}\" using {using} ({decls})",
            mapping.table_name()
        ),
        None => {
            let mut sql = format!(
                "create table if not exists \"{}\" ({decls})",
                mapping.table_name()
            );
            if mapping.without_rowid() {
                sql.push_str(" without rowid");
            }
            sql
        }
    }
}

fn create_index_sql(table: &str, index: &IndexDescriptor) -> String {
    let unique = if index.unique { "unique " } else { "" };
    let columns = index
        .columns
        .iter()
        .map(|column| {
            if column.descending {
                format!("\"{}\" desc", column.name)
            } else {
                format!("\"{}\"", column.name)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "create {unique}index if not exists \"{}\" on \"{table}\" ({columns})",
        index.name
    )
}

pub(crate) struct TableColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub pk: bool,
}

pub(crate) fn table_info(
    conn: &DbConnection,
    table: &str,
) -> Result<Vec<TableColumnInfo>, StorageError> {
    let sql = format!("pragma table_info(\"{table}\")");
    let wrap = |e: rusqlite::Error| classify(e, Some(&sql), None);
    let raw = conn.raw();
    let mut stmt = raw.prepare(&sql).map_err(wrap)?;
    let mut rows = stmt.query([]).map_err(wrap)?;
    let mut info = Vec::new();
    while let Some(row) = rows.next().map_err(wrap)? {
        info.push(TableColumnInfo {
            name: row.get(1).map_err(wrap)?,
            declared_type: row.get(2).map_err(wrap)?,
            not_null: row.get::<_, i64>(3).map_err(wrap)? != 0,
            pk: row.get::<_, i64>(5).map_err(wrap)? != 0,
        });
    }
    Ok(info)
}

struct LiveIndex {
    name: String,
    unique: bool,
    origin: String,
}

fn index_list(conn: &DbConnection, table: &str) -> Result<Vec<LiveIndex>, StorageError> {
    let sql = format!("pragma index_list(\"{table}\")");
    let wrap = |e: rusqlite::Error| classify(e, Some(&sql), None);
    let raw = conn.raw();
    let mut stmt = raw.prepare(&sql).map_err(wrap)?;
    let mut rows = stmt.query([]).map_err(wrap)?;
    let mut indexes = Vec::new();
    while let Some(row) = rows.next().map_err(wrap)? {
        indexes.push(LiveIndex {
            name: row.get(1).map_err(wrap)?,
            unique: row.get::<_, i64>(2).map_err(wrap)? != 0,
            origin: row.get(3).map_err(wrap)?,
        });
    }
    Ok(indexes)
}

fn index_info(conn: &DbConnection, index: &str) -> Result<Vec<String>, StorageError> {
    let sql = format!("pragma index_info(\"{index}\")");
    let wrap = |e: rusqlite::Error| classify(e, Some(&sql), None);
    let raw = conn.raw();
    let mut stmt = raw.prepare(&sql).map_err(wrap)?;
    let mut rows = stmt.query([]).map_err(wrap)?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next().map_err(wrap)? {
        columns.push(row.get(2).map_err(wrap)?);
    }
    Ok(columns)
}
