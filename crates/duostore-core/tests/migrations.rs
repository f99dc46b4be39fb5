//! Integration tests for boot-time migrations and schema repair.

mod common;

use std::sync::Arc;

use rusqlite::Connection;
use serde_json::json;

use common::{FakeConnector, FakeExternal};
use duostore_core::catalog::registry::{PERMISSIONS, ROLES, USERS, VOUCHERS};
use duostore_core::driver::embedded::table_exists;
use duostore_core::migration::{MigrationError, VersionLedger, MIGRATIONS};
use duostore_core::{
    EngineConfig, EngineKind, Error, MigrationRunner, Operation, Params, RepairOutcome, Storage, StorageConfig, TableStore,
};

fn schema_dump(conn: &Connection) -> Vec<(String, String, Option<String>)> {
    let mut stmt = conn
        .prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

#[test]
fn test_second_run_leaves_schema_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = Connection::open(dir.path().join("duostore.db")).unwrap();

    let first = MigrationRunner::new().run(&mut conn).unwrap();
    assert_eq!(first.start_version, 0);
    assert_eq!(first.end_version, 6);
    let after_first = schema_dump(&conn);

    let second = MigrationRunner::new().run(&mut conn).unwrap();
    assert!(second.is_noop());
    assert_eq!(second.end_version, 6);
    assert_eq!(schema_dump(&conn), after_first);
}

#[test]
fn test_ledger_only_moves_forward() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = Connection::open(dir.path().join("duostore.db")).unwrap();
    MigrationRunner::new().run(&mut conn).unwrap();

    let ledger = VersionLedger::open(&conn).unwrap();
    assert_eq!(ledger.read().unwrap(), 6);
    let ordinals: Vec<u32> = ledger.history().unwrap().iter().map(|h| h.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3, 4, 5, 6]);

    assert!(matches!(
        ledger.advance(6, 5),
        Err(MigrationError::NonMonotonic { from: 6, to: 5 })
    ));
    assert!(matches!(
        ledger.advance(5, 7),
        Err(MigrationError::ConcurrentModification {
            expected: 5,
            found: 6
        })
    ));
    assert_eq!(ledger.read().unwrap(), 6);
}

#[test]
fn test_resume_from_partial_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = Connection::open(dir.path().join("duostore.db")).unwrap();

    let partial = MigrationRunner::with_steps(&MIGRATIONS[..3]).run(&mut conn).unwrap();
    assert_eq!(partial.end_version, 3);

    let rest = MigrationRunner::new().run(&mut conn).unwrap();
    assert_eq!(rest.start_version, 3);
    assert_eq!(rest.applied, vec![4, 5, 6]);
}

#[tokio::test]
async fn test_boot_on_empty_directory_seeds_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::new(dir.path().join("nested").join("duostore.db"));
    let connector = Arc::new(FakeConnector(FakeExternal::new()));

    let storage = Storage::initialize_with(config.clone(), connector.clone()).await.unwrap();
    let report = storage.boot_report();
    assert_eq!(report.migrations.applied, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(report.repair.outcome("settings"), Some(&RepairOutcome::Healthy));
    assert_eq!(report.migrations.end_version, MigrationRunner::new().highest_ordinal());
    assert_eq!(storage.embedded().count(&USERS).await.unwrap(), 0);
    let roles = storage.embedded().count(&ROLES).await.unwrap();
    let permissions = storage.embedded().count(&PERMISSIONS).await.unwrap();
    assert_eq!(roles, 3);
    assert_eq!(permissions, 5);
    storage.close().await;
    drop(storage);

    let storage = Storage::initialize_with(config, connector).await.unwrap();
    assert!(storage.boot_report().migrations.is_noop());
    assert_eq!(storage.embedded().count(&ROLES).await.unwrap(), roles);
    assert_eq!(storage.embedded().count(&PERMISSIONS).await.unwrap(), permissions);
}

#[tokio::test]
async fn test_boot_upgrades_legacy_vouchers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duostore.db");
    {
        let mut conn = Connection::open(&path).unwrap();
        MigrationRunner::with_steps(&MIGRATIONS[..4]).run(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO vouchers (id, code, plan, price, used) VALUES ('v1', 'AAA', 'p1', '1,500', 0);
             INSERT INTO vouchers (id, code, plan, price, used) VALUES ('v2', 'BBB', 'p1', '200', 1);
             INSERT INTO vouchers (id, code, plan, price, used) VALUES ('v3', 'CCC', 'p1', 'free', 0);",
        )
        .unwrap();
    }

    let storage = Storage::initialize_with(StorageConfig::new(&path), Arc::new(FakeConnector(FakeExternal::new())))
        .await
        .unwrap();
    assert_eq!(storage.boot_report().migrations.applied, vec![5, 6]);
    assert_eq!(storage.embedded().count(&VOUCHERS).await.unwrap(), 2);

    let rows = storage
        .dispatch("vouchers", Operation::Read, Params::new().with_id("v2"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["price"], json!(200));
    assert_eq!(rows[0]["status"], json!("used"));
    assert_eq!(rows[0]["plan_id"], json!("p1"));
}

#[tokio::test]
async fn test_boot_refuses_database_from_newer_build() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duostore.db");
    {
        let mut conn = Connection::open(&path).unwrap();
        MigrationRunner::new().run(&mut conn).unwrap();
        VersionLedger::open(&conn).unwrap().advance(6, 9).unwrap();
    }

    let err = Storage::initialize_with(StorageConfig::new(&path), Arc::new(FakeConnector(FakeExternal::new())))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::MigrationFailure(MigrationError::LedgerAhead { stored: 9, highest: 6 })
    ));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_boot_rebuilds_drifted_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duostore.db");
    {
        let mut conn = Connection::open(&path).unwrap();
        MigrationRunner::new().run(&mut conn).unwrap();
        conn.execute_batch(
            "DROP TABLE billing_settings;
             CREATE TABLE billing_settings (id INTEGER PRIMARY KEY, currency TEXT, tax_rate TEXT);
             INSERT INTO billing_settings (id, currency, tax_rate) VALUES (1, 'KES', '16');",
        )
        .unwrap();
    }

    let storage = Storage::initialize_with(StorageConfig::new(&path), Arc::new(FakeConnector(FakeExternal::new())))
        .await
        .unwrap();
    assert!(storage.boot_report().repair.repaired_any());
    assert!(matches!(
        storage.boot_report().repair.outcome("billing_settings"),
        Some(RepairOutcome::Rebuilt { .. })
    ));

    let rows = storage
        .dispatch("billing_settings", Operation::Read, Params::new().with_id("currency"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], json!("KES"));
}

#[tokio::test]
async fn test_boot_resumes_interrupted_voucher_restructure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duostore.db");
    {
        let mut conn = Connection::open(&path).unwrap();
        MigrationRunner::with_steps(&MIGRATIONS[..4]).run(&mut conn).unwrap();
        // Left behind by a run that stopped after moving the old table aside.
        conn.execute_batch(
            "INSERT INTO vouchers (id, code, plan, price, used) VALUES ('v1', 'AAA', 'p1', '1,500', 0);
             INSERT INTO vouchers (id, code, plan, price, used) VALUES ('v2', 'BBB', 'p1', '200', 1);
             ALTER TABLE vouchers RENAME TO vouchers__legacy;",
        )
        .unwrap();
    }

    let storage = Storage::initialize_with(StorageConfig::new(&path), Arc::new(FakeConnector(FakeExternal::new())))
        .await
        .unwrap();
    assert_eq!(storage.boot_report().migrations.applied, vec![5, 6]);
    assert_eq!(storage.embedded().count(&VOUCHERS).await.unwrap(), 2);
    let leftover = storage
        .embedded()
        .with_conn(|conn| table_exists(conn, "vouchers__legacy"))
        .unwrap();
    assert!(!leftover);
}

#[tokio::test]
async fn test_boot_restores_settings_key_uniqueness() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("duostore.db");
    {
        let mut conn = Connection::open(&path).unwrap();
        MigrationRunner::new().run(&mut conn).unwrap();
        conn.execute_batch(
            "DROP TABLE settings;
             CREATE TABLE settings (key TEXT, value TEXT);
             INSERT INTO settings (key, value) VALUES ('storage.engine', 'embedded');",
        )
        .unwrap();
    }

    let storage = Storage::initialize_with(StorageConfig::new(&path), Arc::new(FakeConnector(FakeExternal::new())))
        .await
        .unwrap();
    assert!(matches!(
        storage.boot_report().repair.outcome("settings"),
        Some(RepairOutcome::Rebuilt { .. })
    ));

    storage.apply_engine_config(EngineConfig::embedded()).await.unwrap();
    assert_eq!(storage.engine_status().await.engine, EngineKind::Embedded);
}
