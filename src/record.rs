use crate::error::StorageError;
use crate::mapping::TableDescriptor;
use crate::value::Value;

/// A host type that maps to a table.
///
/// Rust has no runtime attribute reflection, so a record describes its
/// table once through a [`TableDescriptor`] builder and moves member
/// values in and out through [`Value`]. The descriptor is built a single
/// time per process and cached by the mapping registry.
///
/// ```rust
/// use sqlite_records::{ColumnBuilder, ColumnKind, Record, StorageError, TableBuilder,
///     TableDescriptor, Value};
///
/// #[derive(Default)]
/// struct Person {
///     id: i64,
///     name: String,
/// }
///
/// impl Record for Person {
///     fn table() -> TableDescriptor {
///         TableBuilder::new("Person")
///             .column(ColumnBuilder::new("id", ColumnKind::BigInteger)
///                 .primary_key()
///                 .auto_increment())
///             .column(ColumnBuilder::new("name", ColumnKind::Text))
///             .build()
///     }
///
///     fn column_value(&self, member: &str) -> Result<Value, StorageError> {
///         match member {
///             "id" => Ok(self.id.into()),
///             "name" => Ok(self.name.clone().into()),
///             other => Err(StorageError::unknown_member::<Self>(other)),
///         }
///     }
///
///     fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
///         match member {
///             "id" => self.id = value.as_integer().unwrap_or_default(),
///             "name" => self.name = value.as_text().unwrap_or_default().to_owned(),
///             other => return Err(StorageError::unknown_member::<Self>(other)),
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Record: Default + 'static {
    /// The table descriptor for this type. Called once per process; the
    /// result is validated and cached by the registry.
    fn table() -> TableDescriptor;

    /// Read the value of the named member.
    ///
    /// # Errors
    ///
    /// Returns an error for a member the descriptor does not declare.
    fn column_value(&self, member: &str) -> Result<Value, StorageError>;

    /// Write a value into the named member.
    ///
    /// # Errors
    ///
    /// Returns an error for a member the descriptor does not declare or
    /// a value the member cannot hold.
    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError>;
}

impl StorageError {
    /// Error for a member name a [`Record`] implementation does not know.
    #[must_use]
    pub fn unknown_member<T>(member: &str) -> StorageError {
        StorageError::InvalidArgument(format!(
            "{} has no member named {member:?}",
            std::any::type_name::<T>()
        ))
    }
}

/// An enum persisted either as its integer index or, for columns flagged
/// store-as-text, as its name.
///
/// The name table replaces the reflection-driven index/name memo the
/// attribute model would provide.
pub trait SqlEnum: Sized {
    /// Stable textual name for the variant.
    fn to_name(&self) -> &'static str;

    /// Resolve a variant from its textual name.
    fn from_name(name: &str) -> Option<Self>;

    /// Stable integer index for the variant.
    fn to_index(&self) -> i64;

    /// Resolve a variant from its integer index.
    fn from_index(index: i64) -> Option<Self>;

    /// The [`Value`] for this variant under the given column flag.
    fn to_value(&self, store_as_text: bool) -> Value {
        if store_as_text {
            Value::Text(self.to_name().to_owned())
        } else {
            Value::Integer(self.to_index())
        }
    }

    /// Resolve a variant from a stored [`Value`], accepting either
    /// representation.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnsupportedBinding`] when the value names
    /// no variant.
    fn from_value(value: &Value) -> Result<Self, StorageError> {
        match value {
            Value::Integer(index) => Self::from_index(*index),
            Value::Text(name) => Self::from_name(name),
            _ => None,
        }
        .ok_or_else(|| {
            StorageError::UnsupportedBinding(format!("{value:?} does not name an enum variant"))
        })
    }
}
