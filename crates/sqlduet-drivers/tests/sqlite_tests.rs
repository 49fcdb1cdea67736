#![cfg(feature = "sqlite")]

//! Integration tests for the SQLite backend

use pretty_assertions::assert_eq;
use sqlduet_core::{
    Connection, ConnectionDescriptor, ConnectionErrorKind, DatabaseDriver, DuetError,
    SchemaIntrospection, TableDescriptor, TableName, Value,
};
use sqlduet_drivers::sqlite::{SqliteConnection, SqliteDriver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT,
        balance REAL DEFAULT 0.0
    )"#,
    r#"CREATE TABLE orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        total REAL NOT NULL,
        status TEXT DEFAULT 'pending'
    )"#,
    "CREATE INDEX idx_orders_status ON orders(status)",
    "INSERT INTO users (username, email, balance) VALUES ('alice', 'alice@example.com', 10.5)",
    "INSERT INTO users (username, email, balance) VALUES ('bob', NULL, 0)",
    "INSERT INTO orders (user_id, total) VALUES (1, 99.0)",
];

/// Build a database file on disk through a session, then reopen it fresh
async fn setup_test_database(dir: &TempDir) -> (PathBuf, Arc<dyn Connection>) {
    let path = dir.path().join("shop.db");

    let builder = SqliteConnection::open(&sqlduet_core::EmbeddedSource::Empty)
        .expect("Failed to open empty database");
    for statement in SCHEMA {
        builder.execute(statement, &[]).await.expect("Failed to setup schema");
    }
    builder
        .as_embedded()
        .unwrap()
        .save_to(&path)
        .await
        .expect("Failed to save test database");
    builder.close().await.unwrap();

    let conn = SqliteDriver::new()
        .connect(&ConnectionDescriptor::embedded_file(&path))
        .await
        .expect("Failed to reopen test database");
    (path, conn)
}

async fn count_users(conn: &dyn Connection) -> i64 {
    let result = conn.query("SELECT count(*) FROM users", &[]).await.unwrap();
    result.rows[0].get(0).and_then(Value::as_i64).unwrap()
}

fn file_bytes(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn test_open_and_close() {
    let dir = TempDir::new().unwrap();
    let (_path, conn) = setup_test_database(&dir).await;

    assert!(!conn.is_closed());
    assert_eq!(count_users(conn.as_ref()).await, 2);

    conn.close().await.unwrap();
    assert!(conn.is_closed());
    // second close is a no-op
    conn.close().await.unwrap();

    let err = conn.query("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, DuetError::SessionClosed));
}

#[tokio::test]
async fn test_missing_file_is_unreachable() {
    let dir = TempDir::new().unwrap();
    let err = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_file(
        dir.path().join("nope.db"),
    ))
    .await
    .err()
    .unwrap();
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Unreachable));
}

#[tokio::test]
async fn test_non_database_file_is_malformed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.db");
    std::fs::write(&path, b"these are not the pages you are looking for, not even close").unwrap();

    let err = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_file(&path))
        .await
        .err()
        .unwrap();
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Malformed));
}

#[tokio::test]
async fn test_edits_stay_in_memory_until_saved() {
    let dir = TempDir::new().unwrap();
    let (path, conn) = setup_test_database(&dir).await;
    let original = file_bytes(&path);

    conn.execute("DELETE FROM orders", &[]).await.unwrap();
    conn.execute("DELETE FROM users WHERE username = 'bob'", &[]).await.unwrap();
    assert_eq!(count_users(conn.as_ref()).await, 1);

    // the file on disk is untouched
    assert_eq!(file_bytes(&path), original);

    // closing discards the edits
    conn.close().await.unwrap();
    let reopened = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_file(&path))
        .await
        .unwrap();
    assert_eq!(count_users(reopened.as_ref()).await, 2);
}

#[tokio::test]
async fn test_dirty_tracking_and_read_all() {
    let dir = TempDir::new().unwrap();
    let (_path, conn) = setup_test_database(&dir).await;
    let embedded = conn.as_embedded().unwrap();

    assert!(!embedded.is_dirty());
    conn.query("SELECT * FROM users", &[]).await.unwrap();
    assert!(!embedded.is_dirty(), "reads must not mark the session dirty");
    assert!(matches!(embedded.read_all().await, Err(DuetError::NothingToSave)));

    conn.execute("UPDATE users SET balance = 1 WHERE id = 2", &[]).await.unwrap();
    assert!(embedded.is_dirty());

    let image = embedded.read_all().await.unwrap();
    assert!(image.starts_with(b"SQLite format 3\0"));
    // exporting does not clear the flag; the caller confirms persistence
    assert!(embedded.is_dirty());
    embedded.mark_clean();
    assert!(!embedded.is_dirty());

    // the exported image opens as its own session
    let copy = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_bytes(image))
        .await
        .unwrap();
    let result = copy
        .query("SELECT balance FROM users WHERE id = 2", &[])
        .await
        .unwrap();
    assert_eq!(result.rows[0].get(0), Some(&Value::Float64(1.0)));
}

#[tokio::test]
async fn test_save_to_writes_and_clears_dirty() {
    let dir = TempDir::new().unwrap();
    let (path, conn) = setup_test_database(&dir).await;
    let embedded = conn.as_embedded().unwrap();

    conn.execute(
        "INSERT INTO users (username) VALUES (?)",
        &[Value::from("carol")],
    )
    .await
    .unwrap();
    embedded.save_to(&path).await.unwrap();
    assert!(!embedded.is_dirty());
    conn.close().await.unwrap();

    let reopened = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_file(&path))
        .await
        .unwrap();
    assert_eq!(count_users(reopened.as_ref()).await, 3);
}

#[tokio::test]
async fn test_introspection() {
    let dir = TempDir::new().unwrap();
    let (_path, conn) = setup_test_database(&dir).await;
    let intro = conn.as_schema_introspection().unwrap();

    assert_eq!(
        intro.list_tables().await.unwrap(),
        vec![TableName::new("orders"), TableName::new("users")]
    );

    let orders = intro.describe_table(&"orders".into()).await.unwrap();
    assert_eq!(orders.schema, None);
    let pk: Vec<&str> = orders.primary_key().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(pk, vec!["id"]);
    assert_eq!(orders.foreign_keys.len(), 1);
    assert_eq!(orders.foreign_keys[0].column, "user_id");
    assert_eq!(orders.foreign_keys[0].referenced_table, "users");
    assert_eq!(orders.foreign_keys[0].referenced_column, "id");
    assert!(orders.indexes.iter().any(|i| i.name == "idx_orders_status" && !i.unique));

    let status = orders.column("status").unwrap();
    assert!(status.nullable);
    assert!(status.has_default);

    let users = intro.describe_table(&"users".into()).await.unwrap();
    assert!(!users.column("username").unwrap().nullable);
    assert!(users.is_unique_column("username"));
    assert!(!users.is_unique_column("email"));
}

#[tokio::test]
async fn test_primary_key_nullability() {
    let conn = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_empty())
        .await
        .unwrap();
    for ddl in [
        "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)",
        "CREATE TABLE tags (code TEXT PRIMARY KEY, label TEXT)",
        "CREATE TABLE big_ids (id BIGINT PRIMARY KEY)",
        "CREATE TABLE pairs (a TEXT, b TEXT, PRIMARY KEY (a, b)) WITHOUT ROWID",
    ] {
        conn.execute(ddl, &[]).await.unwrap();
    }
    // SQLite accepts NULL in a plain TEXT primary key
    conn.execute("INSERT INTO tags (code, label) VALUES (NULL, 'x')", &[])
        .await
        .unwrap();

    let intro = conn.as_schema_introspection().unwrap();
    let nullable = |table: &TableDescriptor, column: &str| {
        table.column(column).unwrap().nullable
    };
    let items = intro.describe_table(&"items".into()).await.unwrap();
    assert!(!nullable(&items, "id"));
    assert!(nullable(&items, "label"));
    let tags = intro.describe_table(&"tags".into()).await.unwrap();
    assert!(nullable(&tags, "code"));
    let big_ids = intro.describe_table(&"big_ids".into()).await.unwrap();
    assert!(nullable(&big_ids, "id"));
    let pairs = intro.describe_table(&"pairs".into()).await.unwrap();
    assert!(!nullable(&pairs, "a"));
    assert!(!nullable(&pairs, "b"));
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let dir = TempDir::new().unwrap();
    let (_path, conn) = setup_test_database(&dir).await;

    {
        let tx = conn.begin_transaction().await.unwrap();
        tx.execute("DELETE FROM orders", &[]).await.unwrap();
        tx.execute("DELETE FROM users", &[]).await.unwrap();
    }
    assert_eq!(count_users(conn.as_ref()).await, 2);
}

#[tokio::test]
async fn test_savepoint_rollback_keeps_outer_transaction() {
    let dir = TempDir::new().unwrap();
    let (_path, conn) = setup_test_database(&dir).await;

    let tx = conn.begin_transaction().await.unwrap();
    tx.execute("INSERT INTO users (username) VALUES ('dave')", &[]).await.unwrap();

    let savepoints = tx.savepoints().unwrap();
    savepoints.savepoint("before_erin").await.unwrap();
    tx.execute("INSERT INTO users (username) VALUES ('erin')", &[]).await.unwrap();
    savepoints.rollback_to_savepoint("before_erin").await.unwrap();
    savepoints.release_savepoint("before_erin").await.unwrap();
    tx.commit().await.unwrap();

    let result = conn
        .query("SELECT username FROM users ORDER BY id", &[])
        .await
        .unwrap();
    let names: Vec<&str> = result.rows.iter().filter_map(|r| r.get(0)?.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob", "dave"]);
}

#[tokio::test]
async fn test_constraint_violation_reports_backend_message() {
    let dir = TempDir::new().unwrap();
    let (_path, conn) = setup_test_database(&dir).await;

    let err = conn
        .execute("INSERT INTO users (username) VALUES ('alice')", &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("UNIQUE constraint failed: users.username"));
    assert!(err.code().is_some());
}

#[tokio::test]
async fn test_blob_values_match_when_bound_back() {
    let conn = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_empty())
        .await
        .unwrap();
    conn.execute("CREATE TABLE files (name TEXT, data BLOB)", &[]).await.unwrap();
    conn.execute(
        "INSERT INTO files VALUES (?, ?)",
        &[Value::from("a"), Value::Bytes(vec![0, 159, 146, 150])],
    )
    .await
    .unwrap();

    let read = conn.query("SELECT data FROM files", &[]).await.unwrap();
    let data = read.rows[0].get(0).cloned().unwrap();
    assert_eq!(data, Value::Bytes(vec![0, 159, 146, 150]));

    let matched = conn
        .query("SELECT name FROM files WHERE data = ?", &[data])
        .await
        .unwrap();
    assert_eq!(matched.row_count(), 1);
}

#[tokio::test]
async fn test_cancel_handle_interrupts_long_query() {
    let conn = sqlduet_drivers::connect(&ConnectionDescriptor::embedded_empty())
        .await
        .unwrap();
    let handle = conn.cancel_handle().unwrap();

    // the statement runs on the blocking pool, so this single-threaded
    // runtime stays free to deliver the interrupt
    let worker = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            conn.query(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT count(*) FROM n",
                &[],
            )
            .await
        })
    };

    let interval = handle.retry_interval().unwrap();
    while !worker.is_finished() {
        handle.cancel().await;
        tokio::time::sleep(interval).await;
    }

    let result = worker.await.unwrap();
    assert!(result.unwrap_err().is_cancelled());
}
