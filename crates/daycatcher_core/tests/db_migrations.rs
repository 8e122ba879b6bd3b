use daycatcher_core::db::migrations::latest_version;
use daycatcher_core::db::{open_db, open_db_shared_memory, DbError};
use rusqlite::Connection;

#[test]
fn shared_memory_store_applies_all_migrations() {
    let conn = open_db_shared_memory("migrations-all").unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    for table in [
        "records",
        "media_assets",
        "grants",
        "grant_participants",
        "share_intents",
    ] {
        assert_table_exists(&conn, table);
    }
}

#[test]
fn shared_memory_connections_see_the_same_rows() {
    let primary = open_db_shared_memory("migrations-shared").unwrap();
    let background = open_db_shared_memory("migrations-shared").unwrap();

    primary
        .execute(
            "INSERT INTO records (record_id, kind, partition, title, created_at, updated_at)
             VALUES ('p-1', 'person', 'owned', 'Ada', 1, 1);",
            [],
        )
        .unwrap();

    let count: i64 = background
        .query_row("SELECT COUNT(*) FROM records;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn opening_same_database_twice_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("owned.sqlite3");

    let first = open_db(&path).unwrap();
    assert_eq!(schema_version(&first), latest_version());
    drop(first);

    let second = open_db(&path).unwrap();
    assert_eq!(schema_version(&second), latest_version());
    assert_table_exists(&second, "media_assets");
}

#[test]
fn foreign_keys_cascade_asset_rows() {
    let conn = open_db_shared_memory("migrations-fk").unwrap();
    conn.execute_batch(
        "INSERT INTO records (record_id, kind, partition, title, created_at, updated_at)
         VALUES ('m-1', 'memory', 'owned', 'Beach', 1, 1);
         INSERT INTO media_assets (asset_id, memory_id, upload_state, download_state)
         VALUES ('a-1', 'm-1', 'pending', 'present');
         DELETE FROM records WHERE record_id = 'm-1';",
    )
    .unwrap();

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM media_assets;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.sqlite3");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    let err = open_db(&path).unwrap_err();
    match err {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_table_exists(conn: &Connection, table_name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = 'table' AND name = ?1
            );",
            [table_name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "table {table_name} does not exist");
}
