//! PostgreSQL driver implementation

use async_trait::async_trait;
use sqlduet_core::{
    Connection, ConnectionDescriptor, ConnectionErrorKind, DatabaseDriver, Dialect,
    DriverCapabilities, DuetError, Result,
};
use std::sync::Arc;

use crate::PostgresConnection;

/// PostgreSQL database driver
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        tracing::debug!("PostgreSQL driver initialized");
        Self
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    fn id(&self) -> &'static str {
        "postgresql"
    }

    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Networked
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            supports_savepoints: true,
            supports_transactional_ddl: true,
            supports_cancellation: true,
            supports_returning: true,
            supports_embedded_persistence: false,
            supports_ssl: true,
        }
    }

    fn default_port(&self) -> Option<u16> {
        Some(5432)
    }

    #[tracing::instrument(skip(self, descriptor), fields(identity = %descriptor.display_identity()))]
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connection>> {
        let ConnectionDescriptor::Network(network) = descriptor else {
            return Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                "PostgreSQL requires a network connection descriptor",
            ));
        };

        let conn = PostgresConnection::connect(network).await?;
        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlduet_core::EmbeddedSource;

    #[tokio::test]
    async fn test_rejects_embedded_descriptor() {
        let driver = PostgresDriver::new();
        let descriptor = ConnectionDescriptor::Embedded {
            source: EmbeddedSource::Empty,
        };
        assert!(!driver.accepts(&descriptor));
        let err = driver.connect(&descriptor).await.err().unwrap();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Malformed));
    }

    #[tokio::test]
    async fn test_empty_host_is_malformed() {
        let driver = PostgresDriver::new();
        let descriptor =
            ConnectionDescriptor::Network(sqlduet_core::NetworkDescriptor::new("", 5432, "app"));
        let err = driver.connect(&descriptor).await.err().unwrap();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Malformed));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let driver = PostgresDriver::new();
        let descriptor = ConnectionDescriptor::Network(
            sqlduet_core::NetworkDescriptor::new("127.0.0.1", 1, "app")
                .with_user("nobody")
                .with_ssl_mode(sqlduet_core::SslMode::Disable),
        );
        let err = driver.connect(&descriptor).await.err().unwrap();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Unreachable));
    }
}
