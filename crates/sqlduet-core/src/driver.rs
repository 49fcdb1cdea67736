//! Database driver trait definition

use crate::{Connection, ConnectionDescriptor, Dialect, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Features a backend supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Supports savepoints inside explicit transactions
    pub supports_savepoints: bool,
    /// Schema changes roll back with the enclosing transaction
    pub supports_transactional_ddl: bool,
    /// Supports interrupting a running statement
    pub supports_cancellation: bool,
    /// Supports RETURNING on INSERT/UPDATE/DELETE
    pub supports_returning: bool,
    /// Holds the database in memory until explicitly saved
    pub supports_embedded_persistence: bool,
    /// Supports SSL/TLS
    pub supports_ssl: bool,
}

/// A backend able to open connections
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Unique identifier for this driver (e.g., "postgresql", "sqlite")
    fn id(&self) -> &'static str;

    /// Human-readable name
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    fn capabilities(&self) -> DriverCapabilities;

    /// Default connection port (None for file-based databases)
    fn default_port(&self) -> Option<u16> {
        None
    }

    /// Whether this driver can open `descriptor`
    fn accepts(&self, descriptor: &ConnectionDescriptor) -> bool {
        descriptor.dialect() == self.dialect()
    }

    /// Open a new connection
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connection>>;
}
