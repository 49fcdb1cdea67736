//! Row mutation reconciler
//!
//! Turns a row edit (the row as last read plus the edited row) into a single
//! targeted UPDATE, and a set of key values into chunked DELETE statements.
//! Values are always bound as parameters.

use serde::{Deserialize, Serialize};
use sqlduet_core::{
    ColumnEquality, Connection, Dialect, DuetError, MutationErrorKind, RowSnapshot,
    TableDescriptor, Transaction, TypeFamily, Value,
};
use uuid::Uuid;

use crate::settings::MutationSettings;
use crate::{ServiceError, ServiceResult};

/// How an UPDATE identifies the row it targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Every column of the row as last read must still match
    #[default]
    FullRow,
    /// Only the primary key must match; the caller vouches for its uniqueness
    PrimaryKey,
}

/// A statement ready to run, with its bound parameters in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct MutationStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Applies row edits and deletions
#[derive(Debug, Clone)]
pub struct RowMutationService {
    strategy: MatchStrategy,
    delete_chunk_size: usize,
}

impl Default for RowMutationService {
    fn default() -> Self {
        Self::from_settings(&MutationSettings::default())
    }
}

impl RowMutationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &MutationSettings) -> Self {
        Self {
            strategy: if settings.trust_primary_key {
                MatchStrategy::PrimaryKey
            } else {
                MatchStrategy::FullRow
            },
            delete_chunk_size: settings.delete_chunk_size.max(1),
        }
    }

    pub fn with_strategy(mut self, strategy: MatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_delete_chunk_size(mut self, size: usize) -> Self {
        self.delete_chunk_size = size.max(1);
        self
    }

    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    pub fn delete_chunk_size(&self) -> usize {
        self.delete_chunk_size
    }

    /// Apply an edit as its own transaction.
    ///
    /// Returns 0 without touching the backend when `before == after`. Fails
    /// with `NoSuchRow` when the row no longer matches `before`, and with
    /// `AmbiguousMatch` (after rolling back) when more than one row matched.
    #[tracing::instrument(skip(self, conn, table, before, after), fields(table = %table.name))]
    pub async fn update(
        &self,
        conn: &dyn Connection,
        table: &TableDescriptor,
        before: &RowSnapshot,
        after: &RowSnapshot,
    ) -> ServiceResult<u64> {
        let Some(statement) = self.build_update(conn.dialect(), table, before, after)? else {
            tracing::debug!("row unchanged, nothing to update");
            return Ok(0);
        };

        let tx = conn.begin_transaction().await?;
        match apply_update(tx.as_ref(), &statement).await {
            Ok(affected) => {
                tx.commit().await?;
                tracing::info!(affected, "row updated");
                Ok(affected)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = %rollback_err, "rollback after failed update failed");
                }
                tracing::warn!(error = %e, "row update rejected");
                Err(e)
            }
        }
    }

    /// Apply an edit inside a transaction the caller owns.
    ///
    /// The statement runs under a savepoint where the backend offers one, so a
    /// rejected edit leaves the caller's transaction as it was.
    #[tracing::instrument(skip(self, tx, dialect, table, before, after), fields(table = %table.name))]
    pub async fn update_in(
        &self,
        tx: &dyn Transaction,
        dialect: Dialect,
        table: &TableDescriptor,
        before: &RowSnapshot,
        after: &RowSnapshot,
    ) -> ServiceResult<u64> {
        let Some(statement) = self.build_update(dialect, table, before, after)? else {
            tracing::debug!("row unchanged, nothing to update");
            return Ok(0);
        };
        with_savepoint(tx, apply_update(tx, &statement)).await
    }

    /// Delete the rows whose `key_column` is one of `ids`, in one transaction.
    ///
    /// `key_column` must identify rows on its own. Text identifiers are
    /// converted to the column's type before binding.
    #[tracing::instrument(
        skip(self, conn, table, ids),
        fields(table = %table.name, key_column = %key_column, id_count = ids.len())
    )]
    pub async fn delete_rows(
        &self,
        conn: &dyn Connection,
        table: &TableDescriptor,
        key_column: &str,
        ids: &[Value],
    ) -> ServiceResult<u64> {
        let statements = self.build_deletes(conn.dialect(), table, key_column, ids)?;
        if statements.is_empty() {
            return Ok(0);
        }

        let tx = conn.begin_transaction().await?;
        match run_deletes(tx.as_ref(), &statements).await {
            Ok(deleted) => {
                tx.commit().await?;
                tracing::info!(deleted, "rows deleted");
                Ok(deleted)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = %rollback_err, "rollback after failed delete failed");
                }
                Err(e)
            }
        }
    }

    /// [`delete_rows`](Self::delete_rows) inside a transaction the caller owns
    pub async fn delete_rows_in(
        &self,
        tx: &dyn Transaction,
        dialect: Dialect,
        table: &TableDescriptor,
        key_column: &str,
        ids: &[Value],
    ) -> ServiceResult<u64> {
        let statements = self.build_deletes(dialect, table, key_column, ids)?;
        if statements.is_empty() {
            return Ok(0);
        }
        with_savepoint(tx, run_deletes(tx, &statements)).await
    }

    /// The UPDATE for an edit, or `None` when nothing changed
    pub fn build_update(
        &self,
        dialect: Dialect,
        table: &TableDescriptor,
        before: &RowSnapshot,
        after: &RowSnapshot,
    ) -> ServiceResult<Option<MutationStatement>> {
        if before.is_empty() {
            return Err(ServiceError::InvalidValue(
                "the row as read has no columns".into(),
            ));
        }
        for column in before.columns().chain(after.columns()) {
            if !table.columns.is_empty() && table.column(column).is_none() {
                return Err(ServiceError::InvalidValue(format!(
                    "table '{}' has no column '{}'",
                    table.name, column
                )));
            }
        }

        let mut changed = Vec::new();
        for (column, value) in after.iter() {
            match before.get(column) {
                Some(old) if old == value => {}
                Some(_) => changed.push((column, value)),
                None => {
                    return Err(ServiceError::InvalidValue(format!(
                        "column '{}' is not part of the row as read",
                        column
                    )));
                }
            }
        }
        if changed.is_empty() {
            return Ok(None);
        }

        let mut params = Vec::new();
        let assignments: Vec<String> = changed
            .into_iter()
            .map(|(column, value)| {
                params.push(value.clone());
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    dialect.placeholder(params.len())
                )
            })
            .collect();

        let predicate = self.match_predicate(dialect, table, before, &mut params);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            dialect.quote_table(table.schema.as_deref(), &table.name),
            assignments.join(", "),
            predicate
        );
        tracing::debug!(sql = %sql, "built update");
        Ok(Some(MutationStatement { sql, params }))
    }

    /// DELETE statements covering `ids`, at most `delete_chunk_size` per statement
    pub fn build_deletes(
        &self,
        dialect: Dialect,
        table: &TableDescriptor,
        key_column: &str,
        ids: &[Value],
    ) -> ServiceResult<Vec<MutationStatement>> {
        let Some(column) = table.column(key_column) else {
            return Err(DuetError::mutation(
                MutationErrorKind::MissingPrimaryKey,
                format!("table '{}' has no column '{}'", table.name, key_column),
            )
            .into());
        };
        if !table.is_unique_column(key_column) {
            return Err(DuetError::mutation(
                MutationErrorKind::MissingPrimaryKey,
                format!(
                    "column '{}' does not uniquely identify rows of '{}'",
                    key_column, table.name
                ),
            )
            .into());
        }

        let family = column.type_family();
        let ids = ids
            .iter()
            .map(|id| coerce_identifier(id, family))
            .collect::<ServiceResult<Vec<Value>>>()?;

        let target = dialect.quote_table(table.schema.as_deref(), &table.name);
        let key = dialect.quote_identifier(key_column);
        let statements = ids
            .chunks(self.delete_chunk_size)
            .map(|chunk| {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| dialect.placeholder(i)).collect();
                MutationStatement {
                    sql: format!(
                        "DELETE FROM {} WHERE {} IN ({})",
                        target,
                        key,
                        placeholders.join(", ")
                    ),
                    params: chunk.to_vec(),
                }
            })
            .collect();
        Ok(statements)
    }

    /// WHERE clause identifying the row; appends its parameters to `params`
    fn match_predicate(
        &self,
        dialect: Dialect,
        table: &TableDescriptor,
        before: &RowSnapshot,
        params: &mut Vec<Value>,
    ) -> String {
        let mut columns: Vec<(&str, &Value)> = Vec::new();

        if self.strategy == MatchStrategy::PrimaryKey {
            let pk = table.primary_key();
            let key_values: Option<Vec<(&str, &Value)>> = pk
                .iter()
                .map(|c| {
                    before
                        .get(&c.name)
                        .filter(|v| !v.is_null())
                        .map(|v| (c.name.as_str(), v))
                })
                .collect();
            match key_values {
                Some(values) if !values.is_empty() => columns = values,
                _ => tracing::debug!("primary key not available in the row, matching the full row"),
            }
        }
        if columns.is_empty() {
            columns = before.iter().collect();
        }

        let conditions: Vec<String> = columns
            .into_iter()
            .filter_map(|(name, value)| {
                let equality = table
                    .column(name)
                    .map_or(ColumnEquality::Direct, |c| dialect.column_equality(&c.declared_type));
                let column = dialect.quote_identifier(name);
                if value.is_null() {
                    return Some(format!("{} IS NULL", column));
                }
                match equality {
                    ColumnEquality::Direct => {
                        params.push(value.clone());
                        Some(format!("{} = {}", column, dialect.placeholder(params.len())))
                    }
                    ColumnEquality::Cast(ty) => {
                        params.push(value.clone());
                        Some(format!(
                            "{}::{} = {}::{}",
                            column,
                            ty,
                            dialect.placeholder(params.len()),
                            ty
                        ))
                    }
                    ColumnEquality::Unsupported => {
                        tracing::debug!(column = %name, "column has no equality operator, left out of the match");
                        None
                    }
                }
            })
            .collect();
        if conditions.is_empty() {
            // an over-broad match is caught by the affected-row check
            return "TRUE".to_string();
        }
        conditions.join(" AND ")
    }
}

async fn apply_update(tx: &dyn Transaction, statement: &MutationStatement) -> ServiceResult<u64> {
    let affected = tx
        .execute(&statement.sql, &statement.params)
        .await?
        .affected_rows;
    match affected {
        0 => Err(DuetError::mutation(
            MutationErrorKind::NoSuchRow,
            "no row matches the row as last read; it may have been changed or deleted",
        )
        .into()),
        1 => Ok(1),
        n => Err(DuetError::mutation(
            MutationErrorKind::AmbiguousMatch,
            format!("{} identical rows matched; none were changed", n),
        )
        .into()),
    }
}

async fn run_deletes(tx: &dyn Transaction, statements: &[MutationStatement]) -> ServiceResult<u64> {
    let mut deleted = 0;
    for statement in statements {
        tracing::debug!(sql = %statement.sql, id_count = statement.params.len(), "deleting chunk");
        deleted += tx
            .execute(&statement.sql, &statement.params)
            .await?
            .affected_rows;
    }
    Ok(deleted)
}

/// Run `work` under a fresh savepoint of `tx`, undoing it on failure
async fn with_savepoint<F>(tx: &dyn Transaction, work: F) -> ServiceResult<u64>
where
    F: std::future::Future<Output = ServiceResult<u64>>,
{
    let Some(savepoints) = tx.savepoints() else {
        tracing::debug!("transaction has no savepoints; a rejected mutation is left to the caller");
        return work.await;
    };

    let name = format!("sqlduet_mutation_{}", Uuid::new_v4().simple());
    savepoints.savepoint(&name).await?;
    match work.await {
        Ok(affected) => {
            savepoints.release_savepoint(&name).await?;
            Ok(affected)
        }
        Err(e) => {
            savepoints.rollback_to_savepoint(&name).await?;
            savepoints.release_savepoint(&name).await?;
            Err(e)
        }
    }
}

/// Convert a row identifier to the key column's type family.
///
/// Text is parsed for numeric and boolean columns so that, for example, the
/// identifier `"1"` binds as an integer rather than as text.
pub fn coerce_identifier(value: &Value, family: TypeFamily) -> ServiceResult<Value> {
    if value.is_null() {
        return Err(ServiceError::InvalidValue(
            "NULL cannot identify a row".into(),
        ));
    }
    let Value::String(text) = value else {
        return Ok(value.clone());
    };
    let trimmed = text.trim();
    let invalid = |expected: &str| {
        ServiceError::InvalidValue(format!("'{}' is not a valid {} identifier", text, expected))
    };

    match family {
        TypeFamily::Integer => trimmed
            .parse::<i64>()
            .map(Value::Int64)
            .map_err(|_| invalid("integer")),
        TypeFamily::Float => trimmed
            .parse::<f64>()
            .map(Value::Float64)
            .map_err(|_| invalid("numeric")),
        TypeFamily::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(Value::Bool(true)),
            "false" | "f" | "0" | "no" => Ok(Value::Bool(false)),
            _ => Err(invalid("boolean")),
        },
        TypeFamily::Text | TypeFamily::Other => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlduet_core::{ColumnDescriptor, IndexDescriptor};

    fn users() -> TableDescriptor {
        let mut table = TableDescriptor::new("users");
        table.columns = vec![
            ColumnDescriptor::new("id", "INTEGER").in_primary_key(1),
            ColumnDescriptor::new("name", "TEXT").not_null(),
            ColumnDescriptor::new("email", "TEXT"),
            ColumnDescriptor::new("age", "INTEGER"),
        ];
        table
    }

    fn alice() -> RowSnapshot {
        RowSnapshot::new()
            .with("id", 1i64)
            .with("name", "alice")
            .with("email", Value::Null)
            .with("age", 30i64)
    }

    #[test]
    fn test_update_sets_changed_columns_and_matches_full_row() {
        let service = RowMutationService::new();
        let after = alice().with("age", 31i64);
        let statement = service
            .build_update(Dialect::Embedded, &users(), &alice(), &after)
            .unwrap()
            .unwrap();

        assert_eq!(
            statement.sql,
            "UPDATE \"users\" SET \"age\" = ? WHERE \"id\" = ? AND \"name\" = ? AND \"email\" IS NULL AND \"age\" = ?"
        );
        assert_eq!(
            statement.params,
            vec![
                Value::Int64(31),
                Value::Int64(1),
                Value::String("alice".into()),
                Value::Int64(30)
            ]
        );
    }

    #[test]
    fn test_update_numbers_placeholders_for_networked() {
        let service = RowMutationService::new();
        let after = alice().with("email", "a@example.com").with("name", "Alice");
        let statement = service
            .build_update(Dialect::Networked, &users(), &alice(), &after)
            .unwrap()
            .unwrap();

        assert_eq!(
            statement.sql,
            "UPDATE \"users\" SET \"name\" = $1, \"email\" = $2 WHERE \"id\" = $3 AND \"name\" = $4 AND \"email\" IS NULL AND \"age\" = $5"
        );
        assert_eq!(statement.params.len(), 5);
    }

    #[test]
    fn test_update_with_trusted_primary_key() {
        let service = RowMutationService::new().with_strategy(MatchStrategy::PrimaryKey);
        let after = alice().with("name", "bob");
        let statement = service
            .build_update(Dialect::Embedded, &users(), &alice(), &after)
            .unwrap()
            .unwrap();
        assert_eq!(statement.sql, "UPDATE \"users\" SET \"name\" = ? WHERE \"id\" = ?");
        assert_eq!(
            statement.params,
            vec![Value::String("bob".into()), Value::Int64(1)]
        );
    }

    #[test]
    fn test_trusted_primary_key_falls_back_without_key_value() {
        let service = RowMutationService::new().with_strategy(MatchStrategy::PrimaryKey);
        let before = RowSnapshot::new().with("name", "alice").with("age", 30i64);
        let after = before.clone().with("age", 31i64);
        let statement = service
            .build_update(Dialect::Embedded, &users(), &before, &after)
            .unwrap()
            .unwrap();
        assert!(statement.sql.ends_with("WHERE \"name\" = ? AND \"age\" = ?"));
    }

    #[test]
    fn test_unchanged_row_builds_nothing() {
        let service = RowMutationService::new();
        assert_eq!(
            service
                .build_update(Dialect::Embedded, &users(), &alice(), &alice())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_update_rejects_unknown_columns() {
        let service = RowMutationService::new();
        let after = alice().with("nickname", "al");
        let err = service
            .build_update(Dialect::Embedded, &users(), &alice(), &after)
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidValue(_)));

        let mut unknown_table = TableDescriptor::new("loose");
        unknown_table.columns.clear();
        let before = RowSnapshot::new().with("x", 1i64);
        let after = RowSnapshot::new().with("y", 2i64);
        assert!(matches!(
            service.build_update(Dialect::Embedded, &unknown_table, &before, &after),
            Err(ServiceError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_identifiers_quote_embedded_quotes() {
        let mut table = TableDescriptor::new("odd\"table");
        table.columns = vec![ColumnDescriptor::new("we\"ird", "TEXT")];
        let before = RowSnapshot::new().with("we\"ird", "a");
        let after = RowSnapshot::new().with("we\"ird", "b");
        let statement = RowMutationService::new()
            .build_update(Dialect::Embedded, &table, &before, &after)
            .unwrap()
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"odd\"\"table\" SET \"we\"\"ird\" = ? WHERE \"we\"\"ird\" = ?"
        );
    }

    #[test]
    fn test_full_row_match_casts_or_skips_types_without_equality() {
        let mut table = TableDescriptor::new("shapes");
        table.columns = vec![
            ColumnDescriptor::new("label", "text"),
            ColumnDescriptor::new("meta", "json"),
            ColumnDescriptor::new("doc", "xml"),
            ColumnDescriptor::new("origin", "point"),
        ];
        let before = RowSnapshot::new()
            .with("label", "a")
            .with("meta", Value::Json(serde_json::json!({"k": 1})))
            .with("doc", "<x/>")
            .with("origin", "(1,2)");
        let after = before.clone().with("label", "b");

        let statement = RowMutationService::new()
            .build_update(Dialect::Networked, &table, &before, &after)
            .unwrap()
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"shapes\" SET \"label\" = $1 WHERE \"label\" = $2 AND \"meta\"::jsonb = $3::jsonb AND \"doc\"::text = $4::text"
        );
        assert_eq!(statement.params.len(), 4);

        // SQLite compares any value with =
        let statement = RowMutationService::new()
            .build_update(Dialect::Embedded, &table, &before, &after)
            .unwrap()
            .unwrap();
        assert!(statement.sql.ends_with("\"doc\" = ? AND \"origin\" = ?"));
    }

    #[test]
    fn test_schema_qualified_and_dotted_table_names() {
        let mut billing = users().in_schema("billing");
        billing.name = "invoices".into();
        let after = alice().with("age", 31i64);
        let statement = RowMutationService::new()
            .with_strategy(MatchStrategy::PrimaryKey)
            .build_update(Dialect::Networked, &billing, &alice(), &after)
            .unwrap()
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"billing\".\"invoices\" SET \"age\" = $1 WHERE \"id\" = $2"
        );

        let mut dotted = users();
        dotted.name = "q3.report".into();
        let statements = RowMutationService::new()
            .build_deletes(Dialect::Networked, &dotted, "id", &[Value::from(1i64)])
            .unwrap();
        assert_eq!(statements[0].sql, "DELETE FROM \"q3.report\" WHERE \"id\" IN ($1)");
    }

    #[test]
    fn test_deletes_are_chunked_and_typed() {
        let service = RowMutationService::new().with_delete_chunk_size(2);
        let ids: Vec<Value> = ["1", "2", "3"].into_iter().map(Value::from).collect();
        let statements = service
            .build_deletes(Dialect::Networked, &users(), "id", &ids)
            .unwrap();

        assert_eq!(
            statements,
            vec![
                MutationStatement {
                    sql: "DELETE FROM \"users\" WHERE \"id\" IN ($1, $2)".into(),
                    params: vec![Value::Int64(1), Value::Int64(2)],
                },
                MutationStatement {
                    sql: "DELETE FROM \"users\" WHERE \"id\" IN ($1)".into(),
                    params: vec![Value::Int64(3)],
                },
            ]
        );
    }

    #[test]
    fn test_delete_requires_unique_column() {
        let service = RowMutationService::new();
        let err = service
            .build_deletes(Dialect::Embedded, &users(), "name", &[Value::from("x")])
            .unwrap_err();
        assert_eq!(err.mutation_kind(), Some(MutationErrorKind::MissingPrimaryKey));

        let err = service
            .build_deletes(Dialect::Embedded, &users(), "missing", &[Value::from("x")])
            .unwrap_err();
        assert_eq!(err.mutation_kind(), Some(MutationErrorKind::MissingPrimaryKey));

        let mut with_unique = users();
        with_unique.indexes.push(IndexDescriptor {
            name: "users_email_key".into(),
            columns: vec!["email".into()],
            unique: true,
        });
        let statements = service
            .build_deletes(Dialect::Embedded, &with_unique, "email", &[Value::from("a@b.c")])
            .unwrap();
        assert_eq!(statements[0].params, vec![Value::String("a@b.c".into())]);
    }

    #[test]
    fn test_coerce_identifier() {
        assert_eq!(
            coerce_identifier(&Value::from(" 42 "), TypeFamily::Integer).unwrap(),
            Value::Int64(42)
        );
        assert_eq!(
            coerce_identifier(&Value::from("2.5"), TypeFamily::Float).unwrap(),
            Value::Float64(2.5)
        );
        assert_eq!(
            coerce_identifier(&Value::from("t"), TypeFamily::Boolean).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            coerce_identifier(&Value::from("007"), TypeFamily::Text).unwrap(),
            Value::String("007".into())
        );
        assert_eq!(
            coerce_identifier(&Value::Int32(7), TypeFamily::Integer).unwrap(),
            Value::Int32(7)
        );
        assert!(coerce_identifier(&Value::from("abc"), TypeFamily::Integer).is_err());
        assert!(coerce_identifier(&Value::Null, TypeFamily::Text).is_err());
    }

    #[test]
    fn test_from_settings() {
        let settings = MutationSettings {
            trust_primary_key: true,
            delete_chunk_size: 0,
        };
        let service = RowMutationService::from_settings(&settings);
        assert_eq!(service.strategy(), MatchStrategy::PrimaryKey);
        assert_eq!(service.delete_chunk_size(), 1);
        assert_eq!(RowMutationService::new().strategy(), MatchStrategy::FullRow);
    }
}
