mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{temp_db, KeyedItem};
use sqlite_records::prelude::*;

fn file_manager(path: &str) -> Result<ConnectionManager, StorageError> {
    ConnectionManager::open(
        ManagerConfig::new(ConnectionConfig::new(path))
            .with_pool_size(1, 2)
            .with_write_lock_timeout(Duration::from_millis(200)),
    )
}

#[test]
fn a_blocked_writer_reports_the_holding_reason() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("lock_timeout");
    let manager = Arc::new(file_manager(&path)?);

    let holder = Arc::clone(&manager);
    let contender = Arc::clone(&manager);
    let outcome = std::thread::spawn(move || {
        holder.write_without_retry("slow import", |_conn| {
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        })
    });
    // Give the holder time to take the lock.
    std::thread::sleep(Duration::from_millis(100));
    let blocked = std::thread::spawn(move || {
        contender.write_without_retry("second writer", |_conn| Ok(()))
    })
    .join()
    .expect("contender thread panicked");

    match blocked {
        Err(StorageError::WriteLockTimeout { held_by, .. }) => {
            assert_eq!(held_by, "slow import");
        }
        other => panic!("expected a write-lock timeout, got {other:?}"),
    }
    outcome.join().expect("holder thread panicked")?;
    manager.close()?;
    Ok(())
}

#[test]
fn in_memory_reads_ride_the_writer() -> Result<(), StorageError> {
    let manager = ConnectionManager::open(ManagerConfig::new(ConnectionConfig::in_memory()))?;
    assert!(manager.is_in_memory());

    manager.write("create tables", |conn| {
        conn.create_table::<KeyedItem>().map(|_| ())
    })?;
    manager.write("seed", |conn| {
        let mut row = KeyedItem {
            id: 1,
            text: "only on the writer".into(),
        };
        conn.insert(&mut row).map(|_| ())
    })?;

    // A pooled reader would open a different, empty in-memory database;
    // the redirect makes the row visible.
    let total: i64 =
        manager.read(|conn| conn.query_scalar("select count(*) from \"KeyedItem\"", Vec::new()))?;
    assert_eq!(total, 1);
    manager.close()?;
    Ok(())
}

#[test]
fn pooled_readers_see_committed_writes() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("pooled_reads");
    let manager = Arc::new(file_manager(&path)?);

    manager.write("create tables", |conn| {
        conn.create_table::<KeyedItem>().map(|_| ())
    })?;
    manager.write("seed", |conn| {
        let mut rows: Vec<KeyedItem> = (1..=10)
            .map(|i| KeyedItem {
                id: i,
                text: format!("#{i}"),
            })
            .collect();
        conn.insert_all(&mut rows, true).map(|_| ())
    })?;

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager.read(|conn| {
                    conn.query_scalar::<i64>("select count(*) from \"KeyedItem\"", Vec::new())
                })
            })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.join().expect("reader thread panicked")?, 10);
    }

    let (free, busy) = manager.reader_counts();
    assert!(busy == 0, "readers must return to the pool");
    assert!(free >= 1 && free <= 2, "pool stays within its bounds");
    manager.close()?;
    Ok(())
}

#[test]
fn bulk_load_round_trips_through_the_surrogate() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("bulk_load");
    let manager = file_manager(&path)?;

    manager.write("create tables", |conn| {
        conn.create_table::<KeyedItem>().map(|_| ())
    })?;
    manager.write("seed", |conn| {
        let mut row = KeyedItem {
            id: 1,
            text: "before bulk".into(),
        };
        conn.insert(&mut row).map(|_| ())
    })?;

    manager.bulk_load_start()?;
    manager.write("bulk rows", |conn| {
        let mut rows: Vec<KeyedItem> = (2..=500)
            .map(|i| KeyedItem {
                id: i,
                text: format!("bulk {i}"),
            })
            .collect();
        conn.insert_all(&mut rows, true).map(|_| ())
    })?;
    manager.bulk_load_finish()?;

    let total: i64 =
        manager.read(|conn| conn.query_scalar("select count(*) from \"KeyedItem\"", Vec::new()))?;
    assert_eq!(total, 500);
    manager.close()?;
    Ok(())
}

#[test]
fn bulk_load_rollback_discards_the_surrogate() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("bulk_rollback");
    let manager = file_manager(&path)?;

    manager.write("create tables", |conn| {
        conn.create_table::<KeyedItem>().map(|_| ())
    })?;
    manager.write("seed", |conn| {
        let mut row = KeyedItem {
            id: 1,
            text: "durable".into(),
        };
        conn.insert(&mut row).map(|_| ())
    })?;

    manager.bulk_load_start()?;
    manager.write("doomed rows", |conn| {
        let mut row = KeyedItem {
            id: 2,
            text: "discarded".into(),
        };
        conn.insert(&mut row).map(|_| ())
    })?;
    manager.bulk_load_rollback()?;

    let total: i64 =
        manager.read(|conn| conn.query_scalar("select count(*) from \"KeyedItem\"", Vec::new()))?;
    assert_eq!(total, 1);
    manager.close()?;
    Ok(())
}

struct TwoStepMigrations;

impl SchemaMigrations for TwoStepMigrations {
    fn latest_version(&self) -> i64 {
        2
    }

    fn migrate(&self, from: i64, step: &mut MigrationStep<'_>) -> Result<(), StorageError> {
        match from {
            0 => step.apply(1, |conn| {
                conn.execute_batch("create table \"Journal\" (\"Id\" integer primary key)")
            }),
            1 => step.apply(2, |conn| {
                conn.execute_batch("alter table \"Journal\" add column \"Note\" varchar")
            }),
            other => Err(StorageError::InvalidArgument(format!(
                "no migration from version {other}"
            ))),
        }
    }
}

#[test]
fn migrations_walk_user_version_to_latest() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("migrations");
    {
        let manager = ConnectionManager::open_with_migrations(
            ManagerConfig::new(ConnectionConfig::new(path.as_str())),
            Some(&TwoStepMigrations),
        )?;
        let version: i64 =
            manager.read(|conn| conn.query_scalar("PRAGMA user_version", Vec::new()))?;
        assert_eq!(version, 2);
        manager.close()?;
    }
    // A second open finds the schema current and runs nothing.
    let manager = ConnectionManager::open_with_migrations(
        ManagerConfig::new(ConnectionConfig::new(path.as_str())),
        Some(&TwoStepMigrations),
    )?;
    let columns: i64 = manager.read(|conn| {
        conn.query_scalar("select count(*) from pragma_table_info('Journal')", Vec::new())
    })?;
    assert_eq!(columns, 2);
    manager.close()?;
    Ok(())
}

struct StuckMigrations;

impl SchemaMigrations for StuckMigrations {
    fn latest_version(&self) -> i64 {
        1
    }

    fn migrate(&self, _from: i64, _step: &mut MigrationStep<'_>) -> Result<(), StorageError> {
        // Never calls apply, so user_version cannot advance.
        Ok(())
    }
}

#[test]
fn a_migration_that_does_not_advance_fails_the_bootstrap() {
    let (_dir, path) = temp_db("stuck_migration");
    let result = ConnectionManager::open_with_migrations(
        ManagerConfig::new(ConnectionConfig::new(path.as_str())),
        Some(&StuckMigrations),
    );
    assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
}

#[test]
fn a_corrupt_database_file_is_deleted_during_bootstrap() {
    let (_dir, path) = temp_db("corrupt");
    std::fs::write(&path, b"this is not a sqlite database, not even close")
        .expect("write garbage");

    let result = file_manager(&path);
    assert!(
        matches!(result, Err(StorageError::Corrupt { .. })),
        "expected a corruption error, got {result:?}"
    );
    assert!(
        !std::path::Path::new(&path).exists(),
        "the corrupt file must be deleted"
    );
}

#[test]
fn a_closed_manager_rejects_further_work() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("closed");
    let manager = file_manager(&path)?;
    manager.close()?;
    assert!(matches!(
        manager.write("late write", |_conn| Ok(())),
        Err(StorageError::Disposed)
    ));
    assert!(matches!(
        manager.read(|_conn| Ok(())),
        Err(StorageError::Disposed)
    ));
    Ok(())
}

#[test]
fn table_changed_fires_on_the_writing_thread() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, path) = temp_db("events");
    let manager = file_manager(&path)?;
    manager.write("create tables", |conn| {
        conn.create_table::<KeyedItem>().map(|_| ())
    })?;

    let events = Arc::new(AtomicUsize::new(0));
    manager.write("subscribe and insert", |conn| {
        let counter = Arc::clone(&events);
        conn.on_table_changed(move |event| {
            assert_eq!(event.table, "KeyedItem");
            counter.fetch_add(event.rows, Ordering::SeqCst);
        });
        let mut row = KeyedItem {
            id: 1,
            text: "evented".into(),
        };
        conn.insert(&mut row).map(|_| ())
    })?;
    assert_eq!(events.load(Ordering::SeqCst), 1);
    manager.close()?;
    Ok(())
}
