//! Integration tests for RowMutationService
//!
//! Transaction scoping and error handling are checked against the
//! MockConnection statement log.

mod common;

use pretty_assertions::assert_eq;
use sqlduet_core::{ColumnDescriptor, Dialect, MutationErrorKind, RowSnapshot, TableDescriptor, Value};
use sqlduet_services::{RowMutationService, ServiceError};

use common::{MockConnection, normalize_savepoints};

fn users() -> TableDescriptor {
    let mut table = TableDescriptor::new("users");
    table.columns = vec![
        ColumnDescriptor::new("id", "integer").in_primary_key(1),
        ColumnDescriptor::new("name", "text").not_null(),
    ];
    table
}

fn row(id: i64, name: &str) -> RowSnapshot {
    RowSnapshot::new().with("id", id).with("name", name)
}

// ============ update Tests ============

#[tokio::test]
async fn update_runs_in_its_own_transaction() {
    let conn = MockConnection::new(Dialect::Networked);
    let service = RowMutationService::new();

    let affected = service
        .update(&conn, &users(), &row(1, "alice"), &row(1, "alicia"))
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(
        conn.sql_log(),
        vec![
            "BEGIN",
            "UPDATE \"users\" SET \"name\" = $1 WHERE \"id\" = $2 AND \"name\" = $3",
            "COMMIT",
        ]
    );
    assert_eq!(
        conn.log()[1].params,
        vec![
            Value::String("alicia".into()),
            Value::Int64(1),
            Value::String("alice".into())
        ]
    );
}

#[tokio::test]
async fn unchanged_row_issues_no_sql() {
    let conn = MockConnection::new(Dialect::Embedded);
    let affected = RowMutationService::new()
        .update(&conn, &users(), &row(1, "alice"), &row(1, "alice"))
        .await
        .unwrap();

    assert_eq!(affected, 0);
    assert!(conn.log().is_empty());
}

#[tokio::test]
async fn no_match_is_reported_and_rolled_back() {
    let conn = MockConnection::new(Dialect::Embedded).with_affected(&[0]);
    let err = RowMutationService::new()
        .update(&conn, &users(), &row(1, "alice"), &row(1, "bob"))
        .await
        .unwrap_err();

    assert_eq!(err.mutation_kind(), Some(MutationErrorKind::NoSuchRow));
    assert_eq!(conn.sql_log().last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn ambiguous_match_is_rolled_back() {
    let conn = MockConnection::new(Dialect::Embedded).with_affected(&[2]);
    let err = RowMutationService::new()
        .update(&conn, &users(), &row(1, "alice"), &row(1, "bob"))
        .await
        .unwrap_err();

    assert_eq!(err.mutation_kind(), Some(MutationErrorKind::AmbiguousMatch));
    let log = conn.sql_log();
    assert_eq!(log.last().map(String::as_str), Some("ROLLBACK"));
    assert!(!log.iter().any(|s| s == "COMMIT"));
}

#[tokio::test]
async fn backend_error_is_surfaced() {
    let conn = MockConnection::new(Dialect::Networked).with_failure();
    let err = RowMutationService::new()
        .update(&conn, &users(), &row(1, "alice"), &row(1, "bob"))
        .await
        .unwrap_err();

    match err {
        ServiceError::Core(core) => assert_eq!(core.code(), Some("XX000")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(conn.sql_log().last().map(String::as_str), Some("ROLLBACK"));
}

#[tokio::test]
async fn update_in_caller_transaction_uses_savepoint() {
    let conn = MockConnection::new(Dialect::Embedded).with_affected(&[1, 2]);
    let tx = conn.transaction();
    let service = RowMutationService::new();

    let affected = service
        .update_in(&tx, Dialect::Embedded, &users(), &row(1, "a"), &row(1, "b"))
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let err = service
        .update_in(&tx, Dialect::Embedded, &users(), &row(2, "c"), &row(2, "d"))
        .await
        .unwrap_err();
    assert_eq!(err.mutation_kind(), Some(MutationErrorKind::AmbiguousMatch));

    assert_eq!(
        normalize_savepoints(conn.sql_log()),
        vec![
            "BEGIN",
            "SAVEPOINT sp",
            "UPDATE \"users\" SET \"name\" = ? WHERE \"id\" = ? AND \"name\" = ?",
            "RELEASE SAVEPOINT sp",
            "SAVEPOINT sp",
            "UPDATE \"users\" SET \"name\" = ? WHERE \"id\" = ? AND \"name\" = ?",
            "ROLLBACK TO SAVEPOINT sp",
            "RELEASE SAVEPOINT sp",
        ]
    );
}

#[tokio::test]
async fn update_in_without_savepoints_leaves_rollback_to_caller() {
    let conn = MockConnection::new(Dialect::Embedded)
        .without_savepoints()
        .with_affected(&[0]);
    let tx = conn.transaction();

    let err = RowMutationService::new()
        .update_in(&tx, Dialect::Embedded, &users(), &row(1, "a"), &row(1, "b"))
        .await
        .unwrap_err();

    assert_eq!(err.mutation_kind(), Some(MutationErrorKind::NoSuchRow));
    assert_eq!(conn.sql_log().len(), 2);
}

// ============ delete_rows Tests ============

#[tokio::test]
async fn delete_rows_chunks_inside_one_transaction() {
    let conn = MockConnection::new(Dialect::Networked).with_affected(&[2, 2, 1]);
    let service = RowMutationService::new().with_delete_chunk_size(2);
    let ids: Vec<Value> = (1..=5).map(|i| Value::String(i.to_string())).collect();

    let deleted = service
        .delete_rows(&conn, &users(), "id", &ids)
        .await
        .unwrap();

    assert_eq!(deleted, 5);
    let log = conn.log();
    assert_eq!(
        log.iter().map(|s| s.sql.as_str()).collect::<Vec<_>>(),
        vec![
            "BEGIN",
            "DELETE FROM \"users\" WHERE \"id\" IN ($1, $2)",
            "DELETE FROM \"users\" WHERE \"id\" IN ($1, $2)",
            "DELETE FROM \"users\" WHERE \"id\" IN ($1)",
            "COMMIT",
        ]
    );
    assert_eq!(log[2].params, vec![Value::Int64(3), Value::Int64(4)]);
}

#[tokio::test]
async fn delete_without_ids_is_a_no_op() {
    let conn = MockConnection::new(Dialect::Embedded);
    let deleted = RowMutationService::new()
        .delete_rows(&conn, &users(), "id", &[])
        .await
        .unwrap();
    assert_eq!(deleted, 0);
    assert!(conn.log().is_empty());
}

#[tokio::test]
async fn delete_on_non_unique_column_is_rejected_before_any_sql() {
    let conn = MockConnection::new(Dialect::Embedded);
    let err = RowMutationService::new()
        .delete_rows(&conn, &users(), "name", &[Value::from("alice")])
        .await
        .unwrap_err();

    assert_eq!(err.mutation_kind(), Some(MutationErrorKind::MissingPrimaryKey));
    assert!(conn.log().is_empty());
}

#[tokio::test]
async fn delete_with_bad_identifier_is_rejected() {
    let conn = MockConnection::new(Dialect::Embedded);
    let err = RowMutationService::new()
        .delete_rows(&conn, &users(), "id", &[Value::from("one")])
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::InvalidValue(_)));
    assert!(conn.log().is_empty());
}

#[tokio::test]
async fn failed_delete_rolls_back() {
    let conn = MockConnection::new(Dialect::Embedded).with_failure();
    let result = RowMutationService::new()
        .delete_rows(&conn, &users(), "id", &[Value::Int64(1)])
        .await;

    assert!(result.is_err());
    assert_eq!(
        conn.sql_log(),
        vec!["BEGIN", "DELETE FROM \"users\" WHERE \"id\" IN (?)", "ROLLBACK"]
    );
}
