use chrono::{DateTime, Duration as TimeSpan, FixedOffset, NaiveDateTime};
use uuid::Uuid;

use crate::error::StorageError;

/// Host-side value that can be bound to a statement parameter or read
/// back from a result column.
///
/// One enum covers every member type a record can persist, so record
/// implementations and helper code never touch driver types directly:
///
/// ```rust
/// use sqlite_records::Value;
///
/// let params = vec![
///     Value::Integer(1),
///     Value::Text("alice".into()),
///     Value::Bool(true),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value
    Null,
    /// Integer value (64-bit; narrower host integers widen on the way in)
    Integer(i64),
    /// Floating point value (64-bit)
    Real(f64),
    /// Text/string value
    Text(String),
    /// Binary data
    Blob(Vec<u8>),
    /// Boolean value (stored as integer 0/1)
    Bool(bool),
    /// Wall-clock date and time, no offset
    DateTime(NaiveDateTime),
    /// Date and time with a UTC offset (always stored as UTC ticks)
    DateTimeOffset(DateTime<FixedOffset>),
    /// Elapsed time (stored as ticks)
    TimeSpan(TimeSpan),
    /// GUID (stored as 36-character hyphenated text)
    Uuid(Uuid),
}

impl Value {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let Value::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let Value::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Boolean view of this value. Integers 0 and 1 coerce, matching the
    /// stored form.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Integer(0) => Some(false),
            Value::Integer(1) => Some(true),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_date_time(&self) -> Option<NaiveDateTime> {
        if let Value::DateTime(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_date_time_offset(&self) -> Option<DateTime<FixedOffset>> {
        if let Value::DateTimeOffset(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_time_span(&self) -> Option<TimeSpan> {
        if let Value::TimeSpan(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(value) => Some(*value),
            Value::Text(value) => Uuid::parse_str(value).ok(),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Real(value) => write!(f, "{value}"),
            Value::Text(value) => write!(f, "{value}"),
            Value::Blob(bytes) => write!(f, "<blob {} bytes>", bytes.len()),
            Value::Bool(value) => write!(f, "{value}"),
            Value::DateTime(value) => write!(f, "{value}"),
            Value::DateTimeOffset(value) => write!(f, "{value}"),
            Value::TimeSpan(value) => write!(f, "{value}"),
            Value::Uuid(value) => write!(f, "{value}"),
        }
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Real(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::DateTime(value)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Value::DateTimeOffset(value)
    }
}

impl From<TimeSpan> for Value {
    fn from(value: TimeSpan) -> Self {
        Value::TimeSpan(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Conversion out of a [`Value`], used by scalar queries and record
/// implementations.
///
/// A NULL input maps to the type's default, mirroring what a scalar
/// query over an empty result produces.
pub trait FromValue: Sized {
    /// Convert a [`Value`] into the host type.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnsupportedBinding`] when the value does
    /// not convert.
    fn from_value(value: Value) -> Result<Self, StorageError>;
}

fn mismatch(expected: &str, value: &Value) -> StorageError {
    StorageError::UnsupportedBinding(format!("cannot read {value:?} as {expected}"))
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(0),
            ref v => v.as_integer().ok_or_else(|| mismatch("integer", v)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide)
            .map_err(|_| StorageError::UnsupportedBinding(format!("integer {wide} out of range")))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(0.0),
            ref v => v.as_real().ok_or_else(|| mismatch("real", v)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(false),
            ref v => v.as_bool().ok_or_else(|| mismatch("bool", v)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Text(text) => Ok(text),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Real(r) => Ok(r.to_string()),
            ref v => Err(mismatch("text", v)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Blob(bytes) => Ok(bytes),
            ref v => Err(mismatch("blob", v)),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::DateTime(dt) => Ok(dt),
            ref v => Err(mismatch("datetime", v)),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(Uuid::nil()),
            ref v => v.as_uuid().ok_or_else(|| mismatch("uuid", v)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, StorageError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
