//! SQLite schema introspection
//!
//! Reads the schema through the table-valued pragma functions so table names
//! are bound as parameters rather than spliced into the pragma text.

use async_trait::async_trait;
use sqlduet_core::{
    ColumnDescriptor, Connection, ForeignKeyDescriptor, IndexDescriptor, Result, SchemaIntrospection,
    TableName, Value,
};

use crate::SqliteConnection;

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn int(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
impl SchemaIntrospection for SqliteConnection {
    #[tracing::instrument(skip(self))]
    async fn list_tables(&self) -> Result<Vec<TableName>> {
        let result = self
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await?;

        let tables: Vec<TableName> = result
            .rows
            .iter()
            .filter_map(|row| text(row.get(0)))
            .map(TableName::new)
            .collect();
        tracing::debug!(table_count = tables.len(), "tables listed");
        Ok(tables)
    }

    #[tracing::instrument(skip(self))]
    async fn get_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>> {
        let result = self
            .query(
                "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
                &[Value::from(table.name.as_str())],
            )
            .await?;
        let without_rowid = self
            .query(
                "SELECT wr FROM pragma_table_list WHERE schema = 'main' AND name = ?1",
                &[Value::from(table.name.as_str())],
            )
            .await?
            .rows
            .first()
            .is_some_and(|row| int(row.get(0)) == 1);
        let pk_width = result.rows.iter().filter(|row| int(row.get(4)) > 0).count();

        let columns = result
            .rows
            .iter()
            .map(|row| {
                let pk = int(row.get(4));
                let declared_type = text(row.get(1)).unwrap_or_default();
                // Only a rowid alias or a WITHOUT ROWID key rejects NULL on its own;
                // other primary key columns accept NULL unless declared NOT NULL
                let rowid_alias = pk_width == 1 && declared_type.eq_ignore_ascii_case("INTEGER");
                let implicit_not_null = pk > 0 && (rowid_alias || without_rowid);
                ColumnDescriptor {
                    name: text(row.get(0)).unwrap_or_default(),
                    declared_type,
                    nullable: int(row.get(2)) == 0 && !implicit_not_null,
                    primary_key: pk > 0,
                    pk_ordinal: (pk > 0).then_some(pk as usize),
                    has_default: row.get(3).is_some_and(|v| !v.is_null()),
                }
            })
            .collect();

        Ok(columns)
    }

    #[tracing::instrument(skip(self))]
    async fn get_foreign_keys(&self, table: &TableName) -> Result<Vec<ForeignKeyDescriptor>> {
        let result = self
            .query(
                "SELECT \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
                &[Value::from(table.name.as_str())],
            )
            .await?;

        let mut fks = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let referenced_table = text(row.get(0)).unwrap_or_default();
            let column = text(row.get(1)).unwrap_or_default();
            // `REFERENCES parent` without a column list targets the parent's primary key
            let referenced_column = match text(row.get(2)) {
                Some(col) => col,
                None => self
                    .get_columns(&TableName::new(referenced_table.as_str()))
                    .await?
                    .into_iter()
                    .find(|c| c.primary_key)
                    .map(|c| c.name)
                    .unwrap_or_else(|| "rowid".to_string()),
            };
            fks.push(ForeignKeyDescriptor {
                column,
                referenced_table,
                referenced_column,
            });
        }

        Ok(fks)
    }

    #[tracing::instrument(skip(self))]
    async fn get_indexes(&self, table: &TableName) -> Result<Vec<IndexDescriptor>> {
        let result = self
            .query(
                "SELECT name, \"unique\" FROM pragma_index_list(?1) ORDER BY name",
                &[Value::from(table.name.as_str())],
            )
            .await?;

        let mut indexes = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let Some(name) = text(row.get(0)) else {
                continue;
            };
            let unique = int(row.get(1)) == 1;

            let cols = self
                .query(
                    "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
                    &[Value::from(name.as_str())],
                )
                .await?;
            let columns = cols
                .rows
                .iter()
                .map(|r| text(r.get(0)).unwrap_or_else(|| "<expression>".to_string()))
                .collect();

            indexes.push(IndexDescriptor {
                name,
                columns,
                unique,
            });
        }

        Ok(indexes)
    }
}
