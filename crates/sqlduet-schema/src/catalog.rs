//! Versioned schema catalog
//!
//! A refresh builds a complete new snapshot and swaps it in only on success, so
//! readers always see the last good catalog. Every successful refresh gets a new
//! version number; derived data (formatted context, layouts) is keyed on it.
//! Snapshots record the session they were read through, and a refresh that
//! finishes after the catalog was invalidated is discarded.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlduet_connection::Session;
use sqlduet_core::{Connection, Dialect, DuetError, Result, TableDescriptor};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Immutable view of every user table at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Starts at 1 and increases with every successful refresh
    pub version: u64,
    /// Session the catalog was read through; `None` for a bare connection
    pub session_id: Option<Uuid>,
    pub dialect: Dialect,
    pub refreshed_at: DateTime<Utc>,
    /// Tables keyed by catalog name, in name order
    pub tables: IndexMap<String, TableDescriptor>,
}

impl CatalogSnapshot {
    pub fn new(version: u64, dialect: Dialect, tables: Vec<TableDescriptor>) -> Self {
        let mut tables: IndexMap<String, TableDescriptor> =
            tables.into_iter().map(|t| (t.catalog_name(), t)).collect();
        tables.sort_keys();
        Self {
            version,
            session_id: None,
            dialect,
            refreshed_at: Utc::now(),
            tables,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Whether this snapshot was read through `session_id`
    pub fn belongs_to(&self, session_id: Uuid) -> bool {
        self.session_id == Some(session_id)
    }

    /// Look up a table by exact name, then by a unique case-insensitive match
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        if let Some(table) = self.tables.get(name) {
            return Some(table);
        }
        let mut matches = self
            .tables
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, table)| table);
        match (matches.next(), matches.next()) {
            (Some(table), None) => Some(table),
            _ => None,
        }
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Schema catalog for the live session
pub struct SchemaCatalog {
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    /// Last version handed out
    version: AtomicU64,
    /// Bumped by every invalidation; a refresh installs only if it is unchanged
    epoch: AtomicU64,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            version: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Re-read the catalog through `session`.
    ///
    /// Waits for exclusive use of the session, so a refresh never overlaps a
    /// running batch.
    #[tracing::instrument(skip(self, session), fields(session_id = %session.id()))]
    pub async fn refresh(&self, session: &Session) -> Result<Arc<CatalogSnapshot>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let guard = session.acquire().await?;
        self.load_and_install(guard.connection(), Some(session.id()), epoch)
            .await
    }

    /// Re-read the catalog through a connection the caller holds exclusively.
    ///
    /// On failure the previous snapshot stays in place and
    /// `Catalog { kind: IntrospectionFailed }` is returned.
    pub async fn refresh_on(&self, conn: &dyn Connection) -> Result<Arc<CatalogSnapshot>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.load_and_install(conn, None, epoch).await
    }

    async fn load_and_install(
        &self,
        conn: &dyn Connection,
        session_id: Option<Uuid>,
        epoch: u64,
    ) -> Result<Arc<CatalogSnapshot>> {
        let tables = match load_tables(conn).await {
            Ok(tables) => tables,
            Err(e) => {
                tracing::error!(error = %e, "schema refresh failed; keeping the previous catalog");
                return Err(match e {
                    e @ (DuetError::Catalog { .. } | DuetError::SessionClosed | DuetError::Busy) => e,
                    other => DuetError::introspection(other.to_string()),
                });
            }
        };

        let mut current = self.current.write();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::warn!("catalog invalidated while refreshing; discarding the stale snapshot");
            return Err(DuetError::SessionClosed);
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut snapshot = CatalogSnapshot::new(version, conn.dialect(), tables);
        snapshot.session_id = session_id;
        let snapshot = Arc::new(snapshot);
        *current = Some(Arc::clone(&snapshot));

        tracing::info!(version, table_count = snapshot.len(), "schema catalog refreshed");
        Ok(snapshot)
    }

    /// Descriptor of `table` from the current snapshot. Never queries the backend.
    pub fn get(&self, table: &str) -> Result<TableDescriptor> {
        let current = self.current.read();
        current
            .as_ref()
            .and_then(|snapshot| snapshot.table(table))
            .cloned()
            .ok_or_else(|| DuetError::NotFound(format!("table '{}'", table)))
    }

    pub fn snapshot(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current.read().clone()
    }

    /// Version of the current snapshot; 0 before the first refresh or after invalidation
    pub fn version(&self) -> u64 {
        self.current.read().as_ref().map_or(0, |s| s.version)
    }

    /// Drop the current snapshot, e.g. when its session closes
    pub fn invalidate(&self) {
        let mut current = self.current.write();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if current.take().is_some() {
            tracing::info!("schema catalog invalidated");
        }
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_tables(conn: &dyn Connection) -> Result<Vec<TableDescriptor>> {
    let introspection = conn.as_schema_introspection().ok_or_else(|| {
        DuetError::introspection(format!(
            "{} connections do not support schema introspection",
            conn.driver_name()
        ))
    })?;

    let names = introspection.list_tables().await?;
    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        tracing::debug!(table = %name, "describing table");
        tables.push(introspection.describe_table(&name).await?);
    }
    Ok(tables)
}
