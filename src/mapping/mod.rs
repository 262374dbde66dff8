//! Record descriptors and their validated, cached form.
//!
//! A [`TableDescriptor`] is what a [`Record`](crate::Record) type
//! declares through the builders; a [`TableMapping`] is the validated
//! cache entry the rest of the crate works against: ordered columns with
//! O(1) lookup, the primary key, grouped index descriptors, and the
//! cached primary-key select.

mod builder;
mod registry;

pub use builder::{ColumnBuilder, TableBuilder, TableDescriptor};
pub use registry::MappingRegistry;

use std::collections::HashMap;

use crate::error::StorageError;
use crate::value::Value;

/// Storage classification of a column's host type. Picks the declared
/// SQL type in DDL and drives read-back coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Stored as integer 0/1.
    Boolean,
    /// Host integers up to 32 bits.
    Integer,
    /// 64-bit host integers (and 32-bit unsigned).
    BigInteger,
    /// 32- or 64-bit floating point, and decimals.
    Real,
    Text,
    Blob,
    /// Wall-clock date and time; ticks or ISO-8601 text depending on
    /// configuration.
    DateTime,
    /// Date and time with offset; always UTC ticks.
    DateTimeOffset,
    /// Elapsed time; always ticks.
    TimeSpan,
    /// GUID; 36-character hyphenated text.
    Uuid,
    /// Enum; integer index, or name text when `store_as_text` is set.
    Enum { store_as_text: bool },
}

impl ColumnKind {
    /// The declared SQL type emitted in DDL for this kind.
    #[must_use]
    pub fn declared_type(self, max_length: Option<u32>, store_date_time_as_ticks: bool) -> String {
        match self {
            ColumnKind::Boolean | ColumnKind::Integer => "integer".to_owned(),
            ColumnKind::BigInteger | ColumnKind::TimeSpan | ColumnKind::DateTimeOffset => {
                "bigint".to_owned()
            }
            ColumnKind::Real => "float".to_owned(),
            ColumnKind::Text | ColumnKind::Enum {
                store_as_text: true,
            } => match max_length {
                Some(n) => format!("varchar({n})"),
                None => "varchar".to_owned(),
            },
            ColumnKind::Blob => "blob".to_owned(),
            ColumnKind::DateTime => {
                if store_date_time_as_ticks {
                    "bigint".to_owned()
                } else {
                    "datetime".to_owned()
                }
            }
            ColumnKind::Uuid => "varchar(36)".to_owned(),
            ColumnKind::Enum {
                store_as_text: false,
            } => "integer".to_owned(),
        }
    }

    fn supports_auto_increment(self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::BigInteger)
    }
}

/// Flags applied when a table is created from a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateFlags(u32);

impl CreateFlags {
    pub const NONE: CreateFlags = CreateFlags(0);
    /// Promote the member literally named `Id` (case-insensitive) to
    /// primary key when no column is flagged.
    pub const IMPLICIT_PK: CreateFlags = CreateFlags(0x01);
    /// Index every non-PK member whose name ends in `Id` (case-insensitive).
    pub const IMPLICIT_INDEX: CreateFlags = CreateFlags(0x02);
    /// Make the implicitly promoted primary key auto-incrementing.
    pub const AUTO_INC_PK: CreateFlags = CreateFlags(0x04);
    /// Create an FTS3 virtual table.
    pub const FULL_TEXT_SEARCH_3: CreateFlags = CreateFlags(0x100);
    /// Create an FTS4 virtual table.
    pub const FULL_TEXT_SEARCH_4: CreateFlags = CreateFlags(0x200);

    #[must_use]
    pub fn contains(self, other: CreateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CreateFlags {
    type Output = CreateFlags;

    fn bitor(self, rhs: CreateFlags) -> CreateFlags {
        CreateFlags(self.0 | rhs.0)
    }
}

/// One column participation in a named (or defaulted) index.
#[derive(Debug, Clone)]
pub(crate) struct IndexSpec {
    pub name: Option<String>,
    pub order: u32,
    pub unique: bool,
    pub descending: bool,
}

/// Builder-side column description, resolved into a [`ColumnMapping`]
/// during validation.
#[derive(Debug, Clone)]
pub(crate) struct ColumnSpec {
    pub member: String,
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub pk: bool,
    pub auto_increment: bool,
    pub auto_guid: bool,
    pub collation: Option<String>,
    pub max_length: Option<u32>,
    pub default_value: Option<Value>,
    pub indices: Vec<IndexSpec>,
}

/// Validated column of a [`TableMapping`].
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    /// Column name in the table.
    pub name: String,
    /// Member name on the host type.
    pub member: String,
    pub kind: ColumnKind,
    pub is_nullable: bool,
    pub is_pk: bool,
    pub is_auto_increment: bool,
    pub is_auto_guid: bool,
    /// True for the primary key and for columns in any unique index.
    pub is_unique: bool,
    pub collation: Option<String>,
    pub max_length: Option<u32>,
    pub default_value: Option<Value>,
}

/// One column inside an [`IndexDescriptor`], in emit order.
#[derive(Debug, Clone)]
pub struct IndexColumn {
    pub order: u32,
    pub name: String,
    pub descending: bool,
}

/// A grouped index over one or more columns.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<IndexColumn>,
}

/// Validated, cached mapping from a record type to its table.
#[derive(Debug)]
pub struct TableMapping {
    type_name: &'static str,
    table_name: String,
    without_rowid: bool,
    create_flags: CreateFlags,
    columns: Vec<ColumnMapping>,
    by_name: HashMap<String, usize>,
    by_lower_name: HashMap<String, usize>,
    by_member: HashMap<String, usize>,
    pk: Option<usize>,
    auto_inc_pk: Option<usize>,
    get_by_pk_sql: Option<String>,
    indices: Vec<IndexDescriptor>,
}

impl TableMapping {
    pub(crate) fn from_descriptor(
        type_name: &'static str,
        descriptor: TableDescriptor,
    ) -> Result<Self, StorageError> {
        let TableDescriptor {
            name: table_name,
            without_rowid,
            flags,
            mut columns,
        } = descriptor;

        apply_implicit_flags(&table_name, flags, &mut columns)?;

        let mut by_name = HashMap::with_capacity(columns.len());
        let mut by_lower_name = HashMap::with_capacity(columns.len());
        let mut by_member = HashMap::with_capacity(columns.len());
        let mut pk = None;

        for (idx, spec) in columns.iter_mut().enumerate() {
            if by_lower_name
                .insert(spec.name.to_lowercase(), idx)
                .is_some()
            {
                return Err(StorageError::InvalidArgument(format!(
                    "{table_name}: duplicate column name {:?}",
                    spec.name
                )));
            }
            by_name.insert(spec.name.clone(), idx);
            if by_member.insert(spec.member.clone(), idx).is_some() {
                return Err(StorageError::InvalidArgument(format!(
                    "{table_name}: duplicate member name {:?}",
                    spec.member
                )));
            }

            if spec.pk {
                if pk.is_some() {
                    return Err(StorageError::InvalidArgument(format!(
                        "{table_name}: more than one primary key column"
                    )));
                }
                pk = Some(idx);
                // A primary key is never nullable.
                spec.nullable = false;
            }
            if spec.auto_increment {
                if !spec.kind.supports_auto_increment() {
                    return Err(StorageError::InvalidArgument(format!(
                        "{table_name}.{}: auto-increment requires integer storage",
                        spec.name
                    )));
                }
                if spec.auto_guid {
                    return Err(StorageError::InvalidArgument(format!(
                        "{table_name}.{}: auto-increment and auto-GUID are mutually exclusive",
                        spec.name
                    )));
                }
            }
            if spec.auto_guid && spec.kind != ColumnKind::Uuid {
                return Err(StorageError::InvalidArgument(format!(
                    "{table_name}.{}: auto-GUID requires a GUID column",
                    spec.name
                )));
            }
        }

        if without_rowid && pk.is_none() {
            return Err(StorageError::InvalidArgument(format!(
                "{table_name}: a WITHOUT ROWID table needs a primary key"
            )));
        }

        let indices = group_indices(&table_name, &columns)?;

        let mapped: Vec<ColumnMapping> = columns
            .into_iter()
            .map(|spec| {
                let in_unique_index = indices
                    .iter()
                    .any(|ix| ix.unique && ix.columns.iter().any(|c| c.name == spec.name));
                ColumnMapping {
                    is_unique: spec.pk || in_unique_index,
                    name: spec.name,
                    member: spec.member,
                    kind: spec.kind,
                    is_nullable: spec.nullable,
                    is_pk: spec.pk,
                    is_auto_increment: spec.auto_increment,
                    is_auto_guid: spec.auto_guid,
                    collation: spec.collation,
                    max_length: spec.max_length,
                    default_value: spec.default_value,
                }
            })
            .collect();

        let auto_inc_pk = pk.filter(|&idx| mapped[idx].is_auto_increment);
        let get_by_pk_sql = pk.map(|idx| {
            format!(
                "select * from \"{table_name}\" where \"{}\" = ?",
                mapped[idx].name
            )
        });

        Ok(Self {
            type_name,
            table_name,
            without_rowid,
            create_flags: flags,
            columns: mapped,
            by_name,
            by_lower_name,
            by_member,
            pk,
            auto_inc_pk,
            get_by_pk_sql,
            indices,
        })
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[must_use]
    pub fn without_rowid(&self) -> bool {
        self.without_rowid
    }

    #[must_use]
    pub fn create_flags(&self) -> CreateFlags {
        self.create_flags
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    /// Column lookup by table column name; exact match first, then
    /// case-insensitive.
    #[must_use]
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnMapping> {
        self.by_name
            .get(name)
            .or_else(|| self.by_lower_name.get(&name.to_lowercase()))
            .map(|&idx| &self.columns[idx])
    }

    /// Column lookup by host member name.
    #[must_use]
    pub fn column_by_member(&self, member: &str) -> Option<&ColumnMapping> {
        self.by_member.get(member).map(|&idx| &self.columns[idx])
    }

    #[must_use]
    pub fn pk(&self) -> Option<&ColumnMapping> {
        self.pk.map(|idx| &self.columns[idx])
    }

    #[must_use]
    pub fn auto_increment_pk(&self) -> Option<&ColumnMapping> {
        self.auto_inc_pk.map(|idx| &self.columns[idx])
    }

    /// Cached `select * ... where pk = ?` text, present when the mapping
    /// has a primary key.
    #[must_use]
    pub fn get_by_primary_key_sql(&self) -> Option<&str> {
        self.get_by_pk_sql.as_deref()
    }

    #[must_use]
    pub fn indices(&self) -> &[IndexDescriptor] {
        &self.indices
    }

    /// Columns bound by an INSERT. A plain insert skips the
    /// auto-increment key; `OR REPLACE` writes every column.
    #[must_use]
    pub fn insert_columns(&self, replacing: bool) -> Vec<&ColumnMapping> {
        self.columns
            .iter()
            .filter(|column| replacing || !column.is_auto_increment)
            .collect()
    }
}

/// Promote the implicit primary key and implicit `...Id` indexes the
/// create flags ask for.
fn apply_implicit_flags(
    table_name: &str,
    flags: CreateFlags,
    columns: &mut [ColumnSpec],
) -> Result<(), StorageError> {
    let has_explicit_pk = columns.iter().any(|column| column.pk);
    if flags.contains(CreateFlags::IMPLICIT_PK) && !has_explicit_pk {
        if let Some(spec) = columns
            .iter_mut()
            .find(|spec| spec.member.eq_ignore_ascii_case("id"))
        {
            spec.pk = true;
            if flags.contains(CreateFlags::AUTO_INC_PK) {
                if !spec.kind.supports_auto_increment() {
                    return Err(StorageError::InvalidArgument(format!(
                        "{table_name}.{}: implicit auto-increment key must be an integer",
                        spec.name
                    )));
                }
                spec.auto_increment = true;
            }
        }
    }
    if flags.contains(CreateFlags::IMPLICIT_INDEX) {
        for spec in columns.iter_mut() {
            let member = &spec.member;
            let looks_like_reference =
                member.len() > 2 && member.to_lowercase().ends_with("id") && !spec.pk;
            if looks_like_reference && spec.indices.is_empty() {
                spec.indices.push(IndexSpec {
                    name: None,
                    order: 0,
                    unique: false,
                    descending: false,
                });
            }
        }
    }
    Ok(())
}

/// Group per-column index participations into index descriptors. Unnamed
/// participations fall back to `{UX|IX}_<table>_<column>`; participants
/// of a shared name must agree on uniqueness.
fn group_indices(
    table_name: &str,
    columns: &[ColumnSpec],
) -> Result<Vec<IndexDescriptor>, StorageError> {
    let mut indices: Vec<IndexDescriptor> = Vec::new();
    for spec in columns {
        for participation in &spec.indices {
            let name = participation.name.clone().unwrap_or_else(|| {
                let prefix = if participation.unique { "UX" } else { "IX" };
                format!("{prefix}_{table_name}_{}", spec.name)
            });
            let column = IndexColumn {
                order: participation.order,
                name: spec.name.clone(),
                descending: participation.descending,
            };
            match indices.iter_mut().find(|ix| ix.name == name) {
                Some(existing) => {
                    if existing.unique != participation.unique {
                        return Err(StorageError::InvalidArgument(format!(
                            "{table_name}: index {name:?} mixes unique and non-unique members"
                        )));
                    }
                    existing.columns.push(column);
                }
                None => indices.push(IndexDescriptor {
                    name,
                    unique: participation.unique,
                    columns: vec![column],
                }),
            }
        }
    }
    for index in &mut indices {
        index.columns.sort_by_key(|column| column.order);
    }
    Ok(indices)
}
