//! Driver registry for the available backends

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use sqlduet_core::{
    Connection, ConnectionDescriptor, ConnectionErrorKind, DatabaseDriver, DuetError, Result,
};

/// Registry of available database drivers, keyed by driver id
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Create a registry with every compiled-in driver registered
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "sqlite")]
        registry.register(Arc::new(crate::sqlite::SqliteDriver::new()));
        #[cfg(feature = "postgres")]
        registry.register(Arc::new(crate::postgres::PostgresDriver::new()));

        registry
    }

    /// Register a driver, replacing any previous driver with the same id
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        let id = driver.id();
        tracing::info!(driver = %id, "registering database driver");
        self.drivers.insert(id, driver);
    }

    /// Get a driver by id
    pub fn get(&self, id: &str) -> Option<Arc<dyn DatabaseDriver>> {
        let driver = self.drivers.get(id).cloned();
        if driver.is_none() {
            tracing::warn!(driver = %id, "driver not found in registry");
        }
        driver
    }

    /// List registered driver ids, sorted
    pub fn list(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.drivers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn has(&self, id: &str) -> bool {
        self.drivers.contains_key(id)
    }

    /// The driver that accepts a descriptor
    pub fn for_descriptor(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn DatabaseDriver>> {
        let mut candidates: Vec<&Arc<dyn DatabaseDriver>> = self
            .drivers
            .values()
            .filter(|driver| driver.accepts(descriptor))
            .collect();
        candidates.sort_by_key(|driver| driver.id());

        candidates.first().map(|driver| Arc::clone(*driver)).ok_or_else(|| {
            DuetError::connection(
                ConnectionErrorKind::Malformed,
                format!(
                    "no {} driver is available in this build",
                    descriptor.dialect().name()
                ),
            )
        })
    }

    /// Open a connection with the driver that accepts `descriptor`
    pub async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connection>> {
        let driver = self.for_descriptor(descriptor)?;
        tracing::debug!(driver = %driver.id(), identity = %descriptor.display_identity(), "dispatching connection");
        driver.connect(descriptor).await
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

static DEFAULT_REGISTRY: LazyLock<DriverRegistry> = LazyLock::new(DriverRegistry::with_defaults);

/// Open a connection using the built-in drivers
pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connection>> {
    DEFAULT_REGISTRY.connect(descriptor).await
}
