//! Backend-neutral catalog model and the introspection trait that fills it

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Schema introspection interface
#[async_trait]
pub trait SchemaIntrospection: Send + Sync {
    /// Names of all user tables.
    ///
    /// Every returned name is accepted verbatim by the other methods.
    async fn list_tables(&self) -> Result<Vec<TableName>>;

    /// Columns in declared order
    async fn get_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>>;

    async fn get_foreign_keys(&self, table: &TableName) -> Result<Vec<ForeignKeyDescriptor>>;

    async fn get_indexes(&self, table: &TableName) -> Result<Vec<IndexDescriptor>>;

    /// Full descriptor of one table
    async fn describe_table(&self, table: &TableName) -> Result<TableDescriptor> {
        Ok(TableDescriptor {
            schema: table.schema.clone(),
            name: table.name.clone(),
            columns: self.get_columns(table).await?,
            foreign_keys: self.get_foreign_keys(table).await?,
            indexes: self.get_indexes(table).await?,
        })
    }
}

/// Name of a table as its backend reports it
///
/// `schema` is `None` for tables in the backend's default namespace (all SQLite
/// tables, PostgreSQL `public`). The name is never split on dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn in_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Key the catalog files this table under
    pub fn catalog_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

impl From<&str> for TableName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.catalog_name())
    }
}

/// A table as seen by the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Namespace outside the backend's default one, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Bare table name
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn table_name(&self) -> TableName {
        TableName {
            schema: self.schema.clone(),
            name: self.name.clone(),
        }
    }

    /// Catalog key: the bare name, or `schema.name` outside the default namespace.
    /// Foreign keys refer to tables by this key.
    pub fn catalog_name(&self) -> String {
        self.table_name().catalog_name()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns ordered by their position in the key
    pub fn primary_key(&self) -> Vec<&ColumnDescriptor> {
        let mut pk: Vec<&ColumnDescriptor> =
            self.columns.iter().filter(|c| c.primary_key).collect();
        pk.sort_by_key(|c| c.pk_ordinal.unwrap_or(usize::MAX));
        pk
    }

    /// Whether `column` alone identifies at most one row: it is the whole
    /// primary key or the only column of a unique index
    pub fn is_unique_column(&self, column: &str) -> bool {
        let pk = self.primary_key();
        if pk.len() == 1 && pk[0].name == column {
            return true;
        }
        self.indexes
            .iter()
            .any(|idx| idx.unique && idx.columns.len() == 1 && idx.columns[0] == column)
    }

    /// Foreign keys whose referenced table is `table`
    pub fn references_to<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a ForeignKeyDescriptor> + 'a {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.referenced_table == table)
    }

    /// Outgoing foreign key declared on `column`, if any
    pub fn foreign_key_for(&self, column: &str) -> Option<&ForeignKeyDescriptor> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }
}

/// A column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Declared type exactly as the backend reports it
    pub declared_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    /// 1-based position inside a composite primary key
    pub pk_ordinal: Option<usize>,
    pub has_default: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
            nullable: true,
            primary_key: false,
            pk_ordinal: None,
            has_default: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn in_primary_key(mut self, ordinal: usize) -> Self {
        self.primary_key = true;
        self.pk_ordinal = Some(ordinal);
        self
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    /// Coarse type family of the declared type, used for value coercion
    pub fn type_family(&self) -> TypeFamily {
        TypeFamily::from_declared(&self.declared_type)
    }
}

/// Coarse grouping of declared column types across both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeFamily {
    Integer,
    Float,
    Boolean,
    Text,
    Other,
}

impl TypeFamily {
    /// Classify a declared type. Follows SQLite affinity rules, extended with the
    /// PostgreSQL type names.
    pub fn from_declared(declared: &str) -> Self {
        let t = declared.to_lowercase();
        let t = t.trim();
        if t.starts_with("bool") {
            TypeFamily::Boolean
        } else if t.starts_with("interval") || t.contains("point") {
            TypeFamily::Other
        } else if t.contains("int") || t == "serial" || t == "bigserial" || t == "smallserial" {
            TypeFamily::Integer
        } else if t.contains("char") || t.contains("clob") || t.contains("text") || t == "uuid" {
            TypeFamily::Text
        } else if t.contains("real")
            || t.contains("floa")
            || t.contains("doub")
            || t.starts_with("numeric")
            || t.starts_with("decimal")
        {
            TypeFamily::Float
        } else {
            TypeFamily::Other
        }
    }
}

/// A single-column foreign key reference. Composite keys are reported as one
/// descriptor per column pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKeyDescriptor {
    pub fn new(
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    /// Participating columns in index order
    pub columns: Vec<String>,
    pub unique: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDescriptor {
        TableDescriptor {
            schema: None,
            name: "users".into(),
            columns: vec![
                ColumnDescriptor::new("id", "INTEGER").in_primary_key(1),
                ColumnDescriptor::new("email", "TEXT"),
                ColumnDescriptor::new("team_id", "INTEGER"),
            ],
            foreign_keys: vec![ForeignKeyDescriptor::new("team_id", "teams", "id")],
            indexes: vec![IndexDescriptor {
                name: "users_email_key".into(),
                columns: vec!["email".into()],
                unique: true,
            }],
        }
    }

    #[test]
    fn test_unique_columns() {
        let t = users();
        assert!(t.is_unique_column("id"));
        assert!(t.is_unique_column("email"));
        assert!(!t.is_unique_column("team_id"));
    }

    #[test]
    fn test_composite_pk_is_not_a_unique_column() {
        let t = TableDescriptor {
            schema: None,
            name: "memberships".into(),
            columns: vec![
                ColumnDescriptor::new("team_id", "int4").in_primary_key(2),
                ColumnDescriptor::new("user_id", "int4").in_primary_key(1),
            ],
            foreign_keys: vec![],
            indexes: vec![],
        };
        assert!(!t.is_unique_column("user_id"));
        let pk: Vec<&str> = t.primary_key().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(pk, vec!["user_id", "team_id"]);
    }

    #[test]
    fn test_type_family() {
        assert_eq!(TypeFamily::from_declared("INTEGER"), TypeFamily::Integer);
        assert_eq!(TypeFamily::from_declared("bigint"), TypeFamily::Integer);
        assert_eq!(TypeFamily::from_declared("character varying(40)"), TypeFamily::Text);
        assert_eq!(TypeFamily::from_declared("double precision"), TypeFamily::Float);
        assert_eq!(TypeFamily::from_declared("boolean"), TypeFamily::Boolean);
        assert_eq!(TypeFamily::from_declared("bytea"), TypeFamily::Other);
        assert_eq!(TypeFamily::from_declared("interval"), TypeFamily::Other);
        assert_eq!(TypeFamily::from_declared(""), TypeFamily::Other);
    }

    #[test]
    fn test_catalog_name_keeps_dotted_names_whole() {
        let dotted = TableDescriptor::new("q3.report");
        assert_eq!(dotted.catalog_name(), "q3.report");
        assert_eq!(dotted.table_name(), TableName::new("q3.report"));

        let billing = TableDescriptor::new("invoices").in_schema("billing");
        assert_eq!(billing.catalog_name(), "billing.invoices");
        assert_eq!(
            billing.table_name(),
            TableName::in_schema("billing", "invoices")
        );
    }

    #[test]
    fn test_foreign_key_lookup() {
        let t = users();
        assert_eq!(t.references_to("teams").count(), 1);
        assert!(t.foreign_key_for("team_id").is_some());
        assert!(t.foreign_key_for("email").is_none());
    }
}
