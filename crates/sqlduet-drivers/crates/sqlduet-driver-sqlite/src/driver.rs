//! SQLite driver implementation

use async_trait::async_trait;
use sqlduet_core::{
    Connection, ConnectionDescriptor, ConnectionErrorKind, DatabaseDriver, Dialect,
    DriverCapabilities, DuetError, Result,
};
use std::sync::Arc;

use crate::SqliteConnection;

/// SQLite database driver
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        tracing::debug!("SQLite driver initialized");
        Self
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    fn id(&self) -> &'static str {
        "sqlite"
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Embedded
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_savepoints: true,
            supports_transactional_ddl: true,
            supports_cancellation: true,
            supports_returning: true,
            supports_embedded_persistence: true,
            supports_ssl: false,
        }
    }

    #[tracing::instrument(skip(self, descriptor), fields(identity = %descriptor.display_identity()))]
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connection>> {
        let ConnectionDescriptor::Embedded { source } = descriptor else {
            return Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                "SQLite requires an embedded connection descriptor",
            ));
        };

        let conn = SqliteConnection::open(source).inspect_err(|e| {
            tracing::error!(error = %e, "failed to open SQLite database");
        })?;
        Ok(Arc::new(conn))
    }
}
