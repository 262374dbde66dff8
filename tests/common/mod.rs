#![allow(dead_code)]

use chrono::{DateTime, Duration as TimeSpan, FixedOffset, NaiveDateTime};
use sqlite_records::prelude::*;
use uuid::Uuid;

/// A fresh database file under a tempdir the caller keeps alive for the
/// duration of the test.
pub fn temp_db(prefix: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir
        .path()
        .join(format!("{prefix}.db"))
        .to_string_lossy()
        .into_owned();
    (dir, path)
}

/// Auto-increment key, a boolean, and an optional text.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TestObj {
    pub id: i64,
    pub flag: bool,
    pub text: Option<String>,
}

impl Record for TestObj {
    fn table() -> TableDescriptor {
        TableBuilder::new("TestObj")
            .column(
                ColumnBuilder::new("Id", ColumnKind::BigInteger)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnBuilder::new("Flag", ColumnKind::Boolean).not_null())
            .column(ColumnBuilder::new("Text", ColumnKind::Text))
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Flag" => Ok(self.flag.into()),
            "Text" => Ok(self.text.clone().into()),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        match member {
            "Id" => self.id = value.as_integer().unwrap_or_default(),
            "Flag" => self.flag = value.as_bool().unwrap_or_default(),
            "Text" => self.text = value.as_text().map(ToOwned::to_owned),
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}

/// Caller-assigned integer key and a text payload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KeyedItem {
    pub id: i64,
    pub text: String,
}

impl Record for KeyedItem {
    fn table() -> TableDescriptor {
        TableBuilder::new("KeyedItem")
            .column(ColumnBuilder::new("Id", ColumnKind::BigInteger).primary_key())
            .column(ColumnBuilder::new("Text", ColumnKind::Text).not_null())
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Text" => Ok(self.text.clone().into()),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        match member {
            "Id" => self.id = value.as_integer().unwrap_or_default(),
            "Text" => self.text = value.as_text().unwrap_or_default().to_owned(),
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}

/// Auto-increment key plus a wall-clock timestamp.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Track {
    pub id: i64,
    pub recorded: Option<NaiveDateTime>,
}

impl Record for Track {
    fn table() -> TableDescriptor {
        TableBuilder::new("Track")
            .column(
                ColumnBuilder::new("Id", ColumnKind::BigInteger)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnBuilder::new("Recorded", ColumnKind::DateTime))
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Recorded" => Ok(self.recorded.into()),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        match member {
            "Id" => self.id = value.as_integer().unwrap_or_default(),
            "Recorded" => self.recorded = value.as_date_time(),
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}

/// Four unique indices across six columns, for index introspection.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Cuaderno {
    pub id: i64,
    pub uno: i64,
    pub dos: i64,
    pub tres: i64,
    pub cuatro: i64,
    pub cinco: i64,
    pub seis: i64,
}

impl Record for Cuaderno {
    fn table() -> TableDescriptor {
        TableBuilder::new("Cuaderno")
            .column(
                ColumnBuilder::new("Id", ColumnKind::BigInteger)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnBuilder::new("Uno", ColumnKind::BigInteger).unique_in("UX_Uno", 0))
            .column(ColumnBuilder::new("Dos", ColumnKind::BigInteger).unique_in("UX_Dos", 0))
            .column(ColumnBuilder::new("Tres", ColumnKind::BigInteger).unique_in("UX_Dos", 1))
            .column(ColumnBuilder::new("Cuatro", ColumnKind::BigInteger).unique_in("UX_Uno_bool", 0))
            .column(ColumnBuilder::new("Cinco", ColumnKind::BigInteger).unique_in("UX_Dos_bool", 0))
            .column(ColumnBuilder::new("Seis", ColumnKind::BigInteger).unique_in("UX_Dos_bool", 1))
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Uno" => Ok(self.uno.into()),
            "Dos" => Ok(self.dos.into()),
            "Tres" => Ok(self.tres.into()),
            "Cuatro" => Ok(self.cuatro.into()),
            "Cinco" => Ok(self.cinco.into()),
            "Seis" => Ok(self.seis.into()),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        let slot = match member {
            "Id" => &mut self.id,
            "Uno" => &mut self.uno,
            "Dos" => &mut self.dos,
            "Tres" => &mut self.tres,
            "Cuatro" => &mut self.cuatro,
            "Cinco" => &mut self.cinco,
            "Seis" => &mut self.seis,
            other => return Err(StorageError::unknown_member::<Self>(other)),
        };
        *slot = value.as_integer().unwrap_or_default();
        Ok(())
    }
}

/// GUID key generated on insert.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GuidRecord {
    pub id: Uuid,
    pub name: String,
}

impl Record for GuidRecord {
    fn table() -> TableDescriptor {
        TableBuilder::new("GuidRecord")
            .column(
                ColumnBuilder::new("Id", ColumnKind::Uuid)
                    .primary_key()
                    .auto_guid(),
            )
            .column(ColumnBuilder::new("Name", ColumnKind::Text).not_null())
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Name" => Ok(self.name.clone().into()),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        match member {
            "Id" => self.id = value.as_uuid().unwrap_or_default(),
            "Name" => self.name = value.as_text().unwrap_or_default().to_owned(),
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}

/// Enum persisted by name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    #[default]
    Red,
    Green,
    Blue,
}

impl SqlEnum for Color {
    fn to_name(&self) -> &'static str {
        match self {
            Color::Red => "Red",
            Color::Green => "Green",
            Color::Blue => "Blue",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Red" => Some(Color::Red),
            "Green" => Some(Color::Green),
            "Blue" => Some(Color::Blue),
            _ => None,
        }
    }

    fn to_index(&self) -> i64 {
        match self {
            Color::Red => 0,
            Color::Green => 1,
            Color::Blue => 2,
        }
    }

    fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Color::Red),
            1 => Some(Color::Green),
            2 => Some(Color::Blue),
            _ => None,
        }
    }
}

/// One member of every supported kind, for the full round trip.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Omnibus {
    pub id: i64,
    pub small: i32,
    pub big: i64,
    pub ratio: f64,
    pub label: String,
    pub payload: Vec<u8>,
    pub active: bool,
    pub seen: Option<NaiveDateTime>,
    pub stamped: Option<DateTime<FixedOffset>>,
    pub elapsed: Option<TimeSpan>,
    pub token: Uuid,
    pub color: Color,
    pub shade: Color,
}

impl Record for Omnibus {
    fn table() -> TableDescriptor {
        TableBuilder::new("Omnibus")
            .column(
                ColumnBuilder::new("Id", ColumnKind::BigInteger)
                    .primary_key()
                    .auto_increment(),
            )
            .column(ColumnBuilder::new("Small", ColumnKind::Integer).not_null())
            .column(ColumnBuilder::new("Big", ColumnKind::BigInteger).not_null())
            .column(ColumnBuilder::new("Ratio", ColumnKind::Real).not_null())
            .column(
                ColumnBuilder::new("Label", ColumnKind::Text)
                    .max_length(120)
                    .not_null(),
            )
            .column(ColumnBuilder::new("Payload", ColumnKind::Blob).not_null())
            .column(ColumnBuilder::new("Active", ColumnKind::Boolean).not_null())
            .column(ColumnBuilder::new("Seen", ColumnKind::DateTime))
            .column(ColumnBuilder::new("Stamped", ColumnKind::DateTimeOffset))
            .column(ColumnBuilder::new("Elapsed", ColumnKind::TimeSpan))
            .column(ColumnBuilder::new("Token", ColumnKind::Uuid).not_null())
            .column(
                ColumnBuilder::new("Color", ColumnKind::Enum { store_as_text: true }).not_null(),
            )
            .column(
                ColumnBuilder::new("Shade", ColumnKind::Enum { store_as_text: false }).not_null(),
            )
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Small" => Ok(self.small.into()),
            "Big" => Ok(self.big.into()),
            "Ratio" => Ok(self.ratio.into()),
            "Label" => Ok(self.label.clone().into()),
            "Payload" => Ok(self.payload.clone().into()),
            "Active" => Ok(self.active.into()),
            "Seen" => Ok(self.seen.into()),
            "Stamped" => Ok(self.stamped.into()),
            "Elapsed" => Ok(self.elapsed.into()),
            "Token" => Ok(self.token.into()),
            "Color" => Ok(self.color.to_value(true)),
            "Shade" => Ok(self.shade.to_value(false)),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        match member {
            "Id" => self.id = value.as_integer().unwrap_or_default(),
            "Small" => self.small = value.as_integer().unwrap_or_default() as i32,
            "Big" => self.big = value.as_integer().unwrap_or_default(),
            "Ratio" => self.ratio = value.as_real().unwrap_or_default(),
            "Label" => self.label = value.as_text().unwrap_or_default().to_owned(),
            "Payload" => self.payload = value.as_blob().unwrap_or_default().to_vec(),
            "Active" => self.active = value.as_bool().unwrap_or_default(),
            "Seen" => self.seen = value.as_date_time(),
            "Stamped" => self.stamped = value.as_date_time_offset(),
            "Elapsed" => self.elapsed = value.as_time_span(),
            "Token" => self.token = value.as_uuid().unwrap_or_default(),
            "Color" => self.color = Color::from_value(&value)?,
            "Shade" => self.shade = Color::from_value(&value)?,
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}
