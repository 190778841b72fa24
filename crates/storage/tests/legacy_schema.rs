#![forbid(unsafe_code)]

use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;
use tl_core::{Claimability, Latch, RecoveryGroup, ServerIdentity};
use tl_storage::{DB_FILE_NAME, SqliteStore, StoreOptions};

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("tl_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn id(value: &str) -> ServerIdentity {
    ServerIdentity::try_new(value).expect("identity")
}

fn seed_legacy_table(storage_dir: &std::path::Path) {
    // A control table written before peer locking: no latch, no backend column,
    // and the owner column carrying `owner,backendURL`.
    let conn = Connection::open(storage_dir.join(DB_FILE_NAME)).expect("open sqlite db");
    conn.execute_batch(
        "CREATE TABLE recovery_leases(\n\
           server_identity TEXT PRIMARY KEY,\n\
           recovery_group TEXT NOT NULL DEFAULT '',\n\
           owner TEXT NOT NULL,\n\
           lease_time_ms INTEGER NOT NULL\n\
         );\n\
         INSERT INTO recovery_leases(server_identity, owner, lease_time_ms)\n\
           VALUES ('cloud001', 'cloud001,http://cloud001:9080', 1000);",
    )
    .expect("seed legacy schema");
}

#[test]
fn open_adds_latch_columns_to_a_legacy_table() {
    let storage_dir = temp_dir("legacy_columns");
    seed_legacy_table(&storage_dir);

    let mut store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("open store");
    let lease = store.lease_get(&id("cloud001")).expect("get").expect("row");
    assert_eq!(lease.owner, id("cloud001"));
    assert_eq!(lease.raw_latch, None);
    assert_eq!(lease.latch, Latch::LegacyMarker(false));
    assert_eq!(
        lease.claimability(1_001, Duration::from_secs(20), true),
        Claimability::Legacy
    );

    // A second open on the migrated file is a no-op.
    drop(store);
    SqliteStore::open(&storage_dir, StoreOptions::default()).expect("reopen store");
}

#[test]
fn legacy_owner_text_still_matches_conditional_writes() {
    let storage_dir = temp_dir("legacy_owner_cas");
    seed_legacy_table(&storage_dir);

    let mut store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("open store");
    let observed = store.lease_get(&id("cloud001")).expect("get").expect("row");
    let claim = observed.reowned(id("cloud002"), 2_000, Latch::held(true), None);
    assert!(
        store
            .lease_compare_and_set(&observed, &claim)
            .expect("cas")
            .is_applied()
    );

    let after = store.lease_get(&id("cloud001")).expect("get").expect("row");
    assert_eq!(after.owner, id("cloud002"));
    assert_eq!(after.raw_latch, Some(3));
}

#[test]
fn unrecognized_latch_value_reads_as_claimable_legacy() {
    let storage_dir = temp_dir("unrecognized_latch");
    let mut store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("open store");
    drop(store);

    let conn = Connection::open(storage_dir.join(DB_FILE_NAME)).expect("open sqlite db");
    conn.execute(
        "INSERT INTO recovery_leases(server_identity, owner, lease_time_ms, latch) \
         VALUES ('cloud004', 'cloud004', 5000, 17)",
        [],
    )
    .expect("insert odd latch");
    drop(conn);

    store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("reopen store");
    let lease = store.lease_get(&id("cloud004")).expect("get").expect("row");
    assert_eq!(lease.latch, Latch::LegacyMarker(true));
    assert_eq!(lease.raw_latch, Some(17));
    assert!(
        lease
            .claimability(5_001, Duration::from_secs(20), true)
            .is_claimable()
    );
}

#[test]
fn malformed_owner_is_reported_not_panicked() {
    let storage_dir = temp_dir("malformed_owner");
    let mut store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("open store");
    drop(store);

    let conn = Connection::open(storage_dir.join(DB_FILE_NAME)).expect("open sqlite db");
    conn.execute(
        "INSERT INTO recovery_leases(server_identity, owner, lease_time_ms) \
         VALUES ('cloud005', ' ', 5000)",
        [],
    )
    .expect("insert bad owner");
    drop(conn);

    store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("reopen store");
    let err = store.lease_get(&id("cloud005")).unwrap_err();
    assert_eq!(err.code(), "MALFORMED_ROW");
}

#[test]
fn open_adds_the_recovery_group_to_the_oldest_tables() {
    let storage_dir = temp_dir("legacy_group");
    let conn = Connection::open(storage_dir.join(DB_FILE_NAME)).expect("open sqlite db");
    conn.execute_batch(
        "CREATE TABLE recovery_leases(\n\
           server_identity TEXT PRIMARY KEY,\n\
           owner TEXT NOT NULL,\n\
           lease_time_ms INTEGER NOT NULL\n\
         );\n\
         INSERT INTO recovery_leases(server_identity, owner, lease_time_ms)\n\
           VALUES ('cloud003', 'cloud003', 1000);",
    )
    .expect("seed groupless schema");
    drop(conn);

    let mut store = SqliteStore::open(&storage_dir, StoreOptions::default()).expect("open store");
    let rows = store.leases_list(&RecoveryGroup::default()).expect("list");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].server_identity, id("cloud003"));
    assert!(rows[0].recovery_group.is_default());
}
