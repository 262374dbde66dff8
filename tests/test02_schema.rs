mod common;

use common::Cuaderno;
use sqlite_records::prelude::*;

#[derive(Debug, Default)]
struct MigratingV1 {
    id: i64,
    name: String,
}

impl Record for MigratingV1 {
    fn table() -> TableDescriptor {
        TableBuilder::new("Migrating")
            .column(ColumnBuilder::new("Id", ColumnKind::BigInteger).primary_key())
            .column(ColumnBuilder::new("Name", ColumnKind::Text))
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
            "Id" => self.id = value.as_integer().unwrap_or_default(),
            "Name" => self.name = value.as_text().unwrap_or_default().to_owned(),
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MigratingV2 {
    id: i64,
    name: String,
    score: f64,
    notes: Option<String>,
}

impl Record for MigratingV2 {
    fn table() -> TableDescriptor {
        TableBuilder::new("Migrating")
            .column(ColumnBuilder::new("Id", ColumnKind::BigInteger).primary_key())
            .column(ColumnBuilder::new("Name", ColumnKind::Text))
            .column(
                ColumnBuilder::new("Score", ColumnKind::Real)
                    .not_null()
                    .default_value(Value::Integer(0)),
            )
            .column(ColumnBuilder::new("Notes", ColumnKind::Text))
            .build()
    }

    fn column_value(&self, member: &str) -> Result<Value, StorageError> {
        match member {
            "Id" => Ok(self.id.into()),
            "Name" => Ok(self.name.clone().into()),
            "Score" => Ok(self.score.into()),
            "Notes" => Ok(self.notes.clone().into()),
            other => Err(StorageError::unknown_member::<Self>(other)),
        }
    }

    fn set_column_value(&mut self, member: &str, value: Value) -> Result<(), StorageError> {
        match member {
            "Id" => self.id = value.as_integer().unwrap_or_default(),
            "Name" => self.name = value.as_text().unwrap_or_default().to_owned(),
            "Score" => self.score = value.as_real().unwrap_or_default(),
            "Notes" => self.notes = value.as_text().map(ToOwned::to_owned),
            other => return Err(StorageError::unknown_member::<Self>(other)),
        }
        Ok(())
    }
}

#[test]
fn create_then_verify_round_trips() -> Result<(), StorageError> {
    let conn = DbConnection::open_in_memory()?;
    assert!(matches!(
        conn.create_table::<MigratingV1>()?,
        CreateTableResult::Created
    ));
    conn.verify_table::<MigratingV1>()?;
    Ok(())
}

#[test]
fn missing_columns_are_added_by_migration() -> Result<(), StorageError> {
    let conn = DbConnection::open_in_memory()?;
    conn.create_table::<MigratingV1>()?;
    let mut seeded = MigratingV1 {
        id: 1,
        name: "kept".into(),
    };
    conn.insert(&mut seeded)?;

    assert!(matches!(
        conn.create_table::<MigratingV2>()?,
        CreateTableResult::Migrated
    ));
    conn.verify_table::<MigratingV2>()?;

    // The pre-migration row is intact and readable through the wider
    // descriptor.
    let fetched: MigratingV2 = conn.get(1)?;
    assert_eq!(fetched.name, "kept");
    assert_eq!(fetched.notes, None);
    Ok(())
}

#[test]
fn create_table_is_idempotent() -> Result<(), StorageError> {
    let conn = DbConnection::open_in_memory()?;
    assert!(matches!(
        conn.create_table::<MigratingV1>()?,
        CreateTableResult::Created
    ));
    assert!(matches!(
        conn.create_table::<MigratingV1>()?,
        CreateTableResult::Migrated
    ));
    Ok(())
}

#[test]
fn four_unique_indices_are_synthesized_and_visible() -> Result<(), StorageError> {
    let conn = DbConnection::open_in_memory()?;
    conn.create_table::<Cuaderno>()?;
    conn.verify_table::<Cuaderno>()?;

    let index_count: i64 = conn.query_scalar(
        "select count(*) from pragma_index_list('Cuaderno')",
        Vec::new(),
    )?;
    assert_eq!(index_count, 4);

    let unique_count: i64 = conn.query_scalar(
        "select count(*) from pragma_index_list('Cuaderno') where \"unique\" = 1",
        Vec::new(),
    )?;
    assert_eq!(unique_count, 4);

    let ux_dos_columns: i64 = conn.query_scalar(
        "select count(*) from pragma_index_info('UX_Dos')",
        Vec::new(),
    )?;
    assert_eq!(ux_dos_columns, 2);
    Ok(())
}

#[test]
fn verify_rejects_a_declared_type_mismatch() -> Result<(), StorageError> {
    let conn = DbConnection::open_in_memory()?;
    // Same shape, wrong declared type for Id.
    conn.execute_batch(
        "create table \"Migrating\" (\"Id\" integer primary key not null, \"Name\" varchar)",
    )?;
    assert!(conn.verify_table::<MigratingV1>().is_err());
    Ok(())
}

#[test]
fn verify_rejects_an_unexpected_extra_index() -> Result<(), StorageError> {
    let conn = DbConnection::open_in_memory()?;
    conn.create_table::<MigratingV1>()?;
    conn.verify_table::<MigratingV1>()?;
    conn.execute_batch("create index \"IX_Stray\" on \"Migrating\" (\"Name\")")?;
    assert!(conn.verify_table::<MigratingV1>().is_err());
    Ok(())
}

#[test]
fn verify_rejects_a_missing_table() {
    let conn = DbConnection::open_in_memory().unwrap();
    assert!(conn.verify_table::<Cuaderno>().is_err());
}
