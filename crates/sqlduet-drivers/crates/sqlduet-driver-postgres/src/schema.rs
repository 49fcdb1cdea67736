//! PostgreSQL schema introspection
//!
//! Tables in `public` are reported without a schema; tables in other user
//! schemas carry it separately, so dotted table names are never split.
//! Foreign keys name their referenced table by catalog name (`schema.table`
//! outside `public`).

use async_trait::async_trait;
use sqlduet_core::{
    ColumnDescriptor, Connection, ForeignKeyDescriptor, IndexDescriptor, Result,
    SchemaIntrospection, TableName, Value,
};

use crate::PostgresConnection;

const DEFAULT_SCHEMA: &str = "public";

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// `$1` schema and `$2` table parameters for the lookups
fn schema_params(table: &TableName) -> [Value; 2] {
    let schema = table.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);
    [Value::from(schema), Value::from(table.name.as_str())]
}

#[async_trait]
impl SchemaIntrospection for PostgresConnection {
    #[tracing::instrument(skip(self))]
    async fn list_tables(&self) -> Result<Vec<TableName>> {
        let result = self
            .query(
                r#"
                SELECT table_schema::text, table_name::text
                FROM information_schema.tables
                WHERE table_type = 'BASE TABLE'
                  AND table_schema NOT IN ('pg_catalog', 'information_schema')
                  AND table_schema NOT LIKE 'pg_toast%'
                  AND table_schema NOT LIKE 'pg_temp%'
                ORDER BY table_schema <> 'public', 1, 2
                "#,
                &[],
            )
            .await?;

        let tables: Vec<TableName> = result
            .rows
            .iter()
            .filter_map(|row| {
                let schema = text(row.get(0))?;
                let name = text(row.get(1))?;
                Some(if schema == DEFAULT_SCHEMA {
                    TableName::new(name)
                } else {
                    TableName::in_schema(schema, name)
                })
            })
            .collect();
        tracing::debug!(table_count = tables.len(), "tables listed");
        Ok(tables)
    }

    #[tracing::instrument(skip(self))]
    async fn get_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>> {
        let result = self
            .query(
                r#"
                SELECT
                    c.column_name::text,
                    CASE
                        WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name::text
                        WHEN c.character_maximum_length IS NOT NULL
                            THEN c.data_type::text || '(' || c.character_maximum_length::text || ')'
                        ELSE c.data_type::text
                    END,
                    c.is_nullable = 'YES',
                    c.column_default IS NOT NULL OR c.is_identity = 'YES',
                    pk.position
                FROM information_schema.columns c
                LEFT JOIN (
                    SELECT kcu.column_name, kcu.ordinal_position::int4 AS position
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                        AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                      AND tc.table_schema = $1::text
                      AND tc.table_name = $2::text
                ) pk ON pk.column_name = c.column_name
                WHERE c.table_schema = $1::text AND c.table_name = $2::text
                ORDER BY c.ordinal_position
                "#,
                &schema_params(table),
            )
            .await?;

        let columns = result
            .rows
            .iter()
            .map(|row| {
                let pk_ordinal = row.get(4).and_then(Value::as_i64).map(|p| p as usize);
                ColumnDescriptor {
                    name: text(row.get(0)).unwrap_or_default(),
                    declared_type: text(row.get(1)).unwrap_or_default(),
                    nullable: row.get(2).and_then(Value::as_bool).unwrap_or(true),
                    primary_key: pk_ordinal.is_some(),
                    pk_ordinal,
                    has_default: row.get(3).and_then(Value::as_bool).unwrap_or(false),
                }
            })
            .collect();

        Ok(columns)
    }

    #[tracing::instrument(skip(self))]
    async fn get_foreign_keys(&self, table: &TableName) -> Result<Vec<ForeignKeyDescriptor>> {
        // conkey/confkey pair up column by column, which keeps composite keys aligned
        let result = self
            .query(
                r#"
                SELECT
                    a.attname::text,
                    CASE WHEN rn.nspname = 'public' THEN rc.relname::text
                         ELSE rn.nspname::text || '.' || rc.relname::text END,
                    ra.attname::text
                FROM pg_constraint con
                JOIN pg_class c ON c.oid = con.conrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_class rc ON rc.oid = con.confrelid
                JOIN pg_namespace rn ON rn.oid = rc.relnamespace
                CROSS JOIN LATERAL unnest(con.conkey, con.confkey)
                    WITH ORDINALITY AS k(attnum, ref_attnum, ord)
                JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.ref_attnum
                WHERE con.contype = 'f'
                  AND n.nspname = $1::text
                  AND c.relname = $2::text
                ORDER BY con.conname, k.ord
                "#,
                &schema_params(table),
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .map(|row| ForeignKeyDescriptor {
                column: text(row.get(0)).unwrap_or_default(),
                referenced_table: text(row.get(1)).unwrap_or_default(),
                referenced_column: text(row.get(2)).unwrap_or_default(),
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn get_indexes(&self, table: &TableName) -> Result<Vec<IndexDescriptor>> {
        let result = self
            .query(
                r#"
                SELECT
                    i.relname::text,
                    ix.indisunique,
                    ARRAY(
                        SELECT COALESCE(a.attname::text, '<expression>')
                        FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
                        LEFT JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
                        WHERE k.ord <= ix.indnkeyatts
                        ORDER BY k.ord
                    )
                FROM pg_class t
                JOIN pg_namespace n ON n.oid = t.relnamespace
                JOIN pg_index ix ON ix.indrelid = t.oid
                JOIN pg_class i ON i.oid = ix.indexrelid
                WHERE n.nspname = $1::text AND t.relname = $2::text
                ORDER BY i.relname
                "#,
                &schema_params(table),
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                Some(IndexDescriptor {
                    name: text(row.get(0))?,
                    unique: row.get(1).and_then(Value::as_bool).unwrap_or(false),
                    columns: row.get(2).and_then(Value::as_string_array).unwrap_or_default(),
                })
            })
            .collect())
    }
}
