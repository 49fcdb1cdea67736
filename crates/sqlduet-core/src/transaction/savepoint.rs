//! Savepoint support for database transactions
//!
//! Savepoints are named markers inside a transaction that can be rolled back to
//! without aborting the whole transaction. Both backends use the standard
//! `SAVEPOINT` / `ROLLBACK TO SAVEPOINT` / `RELEASE SAVEPOINT` syntax.

use crate::{DuetError, Result};
use async_trait::async_trait;

/// A savepoint within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    /// Create a savepoint handle, rejecting names that are not plain identifiers
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_savepoint_name(&name)?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_sql(&self) -> String {
        format!("SAVEPOINT {}", self.name)
    }

    pub fn rollback_sql(&self) -> String {
        format!("ROLLBACK TO SAVEPOINT {}", self.name)
    }

    pub fn release_sql(&self) -> String {
        format!("RELEASE SAVEPOINT {}", self.name)
    }
}

/// Savepoint names are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is accepted
pub fn validate_savepoint_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(DuetError::Other(format!("invalid savepoint name '{}'", name)))
    }
}

/// Trait for transactions that support savepoints.
///
/// # Example
/// ```ignore
/// let tx = conn.begin_transaction().await?;
/// tx.execute("INSERT INTO users VALUES (1, 'Alice')", &[]).await?;
///
/// let sp = tx.savepoints().unwrap();
/// sp.savepoint("before_bob").await?;
/// tx.execute("INSERT INTO users VALUES (2, 'Bob')", &[]).await?;
/// sp.rollback_to_savepoint("before_bob").await?;
///
/// tx.commit().await?;
/// ```
#[async_trait]
pub trait SavepointSupport: Send + Sync {
    async fn savepoint(&self, name: &str) -> Result<Savepoint>;

    /// Undo everything done after the savepoint. The savepoint stays valid.
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()>;

    async fn release_savepoint(&self, name: &str) -> Result<()>;
}
