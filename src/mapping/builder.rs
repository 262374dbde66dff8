use crate::value::Value;

use super::{ColumnKind, ColumnSpec, CreateFlags, IndexSpec};

/// Everything a record type declares about its table. Produced by
/// [`TableBuilder`] and consumed once by the registry.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub(crate) name: String,
    pub(crate) without_rowid: bool,
    pub(crate) flags: CreateFlags,
    pub(crate) columns: Vec<ColumnSpec>,
}

/// Fluent builder for a [`TableDescriptor`].
#[derive(Debug, Clone)]
pub struct TableBuilder {
    descriptor: TableDescriptor,
}

impl TableBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: TableDescriptor {
                name: name.into(),
                without_rowid: false,
                flags: CreateFlags::NONE,
                columns: Vec::new(),
            },
        }
    }

    /// Declare the table WITHOUT ROWID. Requires a primary key column.
    #[must_use]
    pub fn without_rowid(mut self) -> Self {
        self.descriptor.without_rowid = true;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: CreateFlags) -> Self {
        self.descriptor.flags = flags;
        self
    }

    #[must_use]
    pub fn column(mut self, column: ColumnBuilder) -> Self {
        self.descriptor.columns.push(column.spec);
        self
    }

    #[must_use]
    pub fn build(self) -> TableDescriptor {
        self.descriptor
    }
}

/// Fluent builder for one column of a [`TableDescriptor`].
///
/// The column name defaults to the member name; columns are nullable
/// unless flagged `not_null` or promoted to primary key.
#[derive(Debug, Clone)]
pub struct ColumnBuilder {
    spec: ColumnSpec,
}

impl ColumnBuilder {
    #[must_use]
    pub fn new(member: impl Into<String>, kind: ColumnKind) -> Self {
        let member = member.into();
        Self {
            spec: ColumnSpec {
                name: member.clone(),
                member,
                kind,
                nullable: true,
                pk: false,
                auto_increment: false,
                auto_guid: false,
                collation: None,
                max_length: None,
                default_value: None,
                indices: Vec::new(),
            },
        }
    }

    /// Override the column name (the member name stays as given to
    /// [`ColumnBuilder::new`]).
    #[must_use]
    pub fn column_name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.spec.pk = true;
        self.spec.nullable = false;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.spec.auto_increment = true;
        self
    }

    /// Generate a fresh GUID for the key when inserting a record whose
    /// key is the nil GUID.
    #[must_use]
    pub fn auto_guid(mut self) -> Self {
        self.spec.auto_guid = true;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.spec.nullable = false;
        self
    }

    /// Join an unnamed single-column non-unique index
    /// (`IX_<table>_<column>`).
    #[must_use]
    pub fn indexed(self) -> Self {
        self.indexed_with(None, 0, false, false)
    }

    /// Join an unnamed single-column unique index (`UX_<table>_<column>`).
    #[must_use]
    pub fn unique(self) -> Self {
        self.indexed_with(None, 0, true, false)
    }

    /// Join a named index at the given order.
    #[must_use]
    pub fn indexed_in(self, name: &str, order: u32) -> Self {
        self.indexed_with(Some(name), order, false, false)
    }

    /// Join a named unique index at the given order.
    #[must_use]
    pub fn unique_in(self, name: &str, order: u32) -> Self {
        self.indexed_with(Some(name), order, true, false)
    }

    /// Join an index with full control over name, order, uniqueness, and
    /// sort direction. All participants of one name must agree on
    /// uniqueness.
    #[must_use]
    pub fn indexed_with(
        mut self,
        name: Option<&str>,
        order: u32,
        unique: bool,
        descending: bool,
    ) -> Self {
        self.spec.indices.push(IndexSpec {
            name: name.map(ToOwned::to_owned),
            order,
            unique,
            descending,
        });
        self
    }

    /// Collation sequence for the column; the engine default (BINARY)
    /// applies when unset.
    #[must_use]
    pub fn collate(mut self, collation: impl Into<String>) -> Self {
        self.spec.collation = Some(collation.into());
        self
    }

    /// Maximum string length; renders the declared type `varchar(n)`.
    #[must_use]
    pub fn max_length(mut self, length: u32) -> Self {
        self.spec.max_length = Some(length);
        self
    }

    /// Declared default value, emitted in DDL and used when a stored
    /// temporal value is out of range.
    #[must_use]
    pub fn default_value(mut self, value: Value) -> Self {
        self.spec.default_value = Some(value);
        self
    }
}
