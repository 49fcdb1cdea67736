//! Connection trait and transaction handling

use crate::{Dialect, ExecuteResult, QueryResult, Result, SavepointSupport, SchemaIntrospection, Value};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Handle for cancelling a running statement from any task.
///
/// Calling `cancel` when nothing is running is a no-op.
#[async_trait]
pub trait QueryCancelHandle: Send + Sync {
    /// Ask the backend to stop the running statement; returns once the request
    /// has been delivered
    async fn cancel(&self);

    /// How often `cancel` must be repeated while the statement keeps running.
    ///
    /// `None` means one request is enough. Backends that cancel whatever runs
    /// when the request lands must return `None`, or a repeat could reach the
    /// next statement.
    fn retry_interval(&self) -> Option<Duration> {
        None
    }
}

/// A live backend connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Driver name (e.g. "sqlite", "postgresql")
    fn driver_name(&self) -> &str;

    /// SQL dialect spoken by this connection
    fn dialect(&self) -> Dialect;

    /// Execute a statement that does not return rows
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult>;

    /// Execute a statement that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Begin an explicit transaction
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Release the underlying handle. Closing twice is not an error.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        None
    }

    /// Persistence hooks, present only on embedded connections
    fn as_embedded(&self) -> Option<&dyn EmbeddedPersistence> {
        None
    }

    /// Returns `None` if the driver cannot interrupt a running statement
    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        None
    }

    /// Whether schema changes participate in the enclosing transaction
    fn supports_transactional_ddl(&self) -> bool {
        true
    }
}

/// An explicit transaction.
///
/// Dropping a transaction that was neither committed nor rolled back rolls it back.
#[async_trait]
pub trait Transaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult>;

    fn savepoints(&self) -> Option<&dyn SavepointSupport> {
        None
    }
}

/// In-memory working copy of an embedded database.
///
/// Edits accumulate in memory until the caller explicitly exports or saves them;
/// closing the connection discards anything unsaved.
#[async_trait]
pub trait EmbeddedPersistence: Send + Sync {
    /// Whether changes were made since the last load or save
    fn is_dirty(&self) -> bool;

    /// Serialize the current database image.
    ///
    /// Fails with `DuetError::NothingToSave` when there is nothing new to export.
    async fn read_all(&self) -> Result<Vec<u8>>;

    /// Record that the current image has been persisted by the caller
    fn mark_clean(&self);

    /// Write the current image to `path` and mark the session clean
    async fn save_to(&self, path: &Path) -> Result<()>;
}
