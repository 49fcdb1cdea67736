//! Workspace facade
//!
//! The single entry point used by the UI layer. It owns the session manager,
//! the schema catalog of the live session and the derived caches, and wires
//! them together: opening or closing a session discards the catalog, and a
//! batch that changed the schema refreshes it.

use parking_lot::RwLock;
use sqlduet_connection::{Session, SessionInfo, SessionManager};
use sqlduet_core::{ConnectionDescriptor, Dialect, DuetError, RowSnapshot, TableDescriptor, Value};
use sqlduet_drivers::DriverRegistry;
use sqlduet_query::{BatchExecutor, BatchResult, CancellationToken};
use sqlduet_schema::{CatalogSnapshot, ForeignKeyGraph, SchemaCatalog, SchemaContextCache};
use std::path::Path;
use std::sync::Arc;

use crate::{DuetSettings, RowMutationService, ServiceResult};

pub struct Workspace {
    settings: RwLock<DuetSettings>,
    sessions: SessionManager,
    catalog: SchemaCatalog,
    context_cache: SchemaContextCache,
}

impl Workspace {
    pub fn new(settings: DuetSettings) -> Self {
        Self::with_registry(settings, DriverRegistry::with_defaults())
    }

    pub fn with_registry(settings: DuetSettings, drivers: DriverRegistry) -> Self {
        let sessions =
            SessionManager::with_registry(drivers).with_busy_policy(settings.session.busy_policy);
        Self {
            settings: RwLock::new(settings),
            sessions,
            catalog: SchemaCatalog::new(),
            context_cache: SchemaContextCache::new(),
        }
    }

    pub fn settings(&self) -> DuetSettings {
        self.settings.read().clone()
    }

    /// Replace the settings. The busy policy applies from the next session on.
    pub fn update_settings(&self, settings: DuetSettings) -> ServiceResult<()> {
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    /// Open a session. Fails with `SessionAlreadyOpen` while another one is live.
    #[tracing::instrument(skip(self, descriptor), fields(identity = %descriptor.display_identity()))]
    pub async fn open_connection(&self, descriptor: &ConnectionDescriptor) -> ServiceResult<SessionInfo> {
        let session = self.sessions.open(descriptor).await?;
        self.discard_catalog();
        Ok(session.info())
    }

    /// Close the live session. Unsaved embedded edits are discarded.
    #[tracing::instrument(skip(self))]
    pub async fn close_connection(&self) -> ServiceResult<()> {
        let result = self.sessions.close().await;
        if !matches!(result, Err(DuetError::NoActiveSession)) {
            self.discard_catalog();
        }
        result.map_err(Into::into)
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.sessions.current().map(|s| s.info())
    }

    pub fn is_connected(&self) -> bool {
        self.sessions.is_open()
    }

    /// Re-read the catalog of the live session
    pub async fn refresh_schema(&self) -> ServiceResult<Arc<CatalogSnapshot>> {
        let session = self.session()?;
        Ok(self.catalog.refresh(&session).await?)
    }

    /// The live session's catalog, loading it on first use. A snapshot read
    /// through any other session is never served.
    pub async fn schema(&self) -> ServiceResult<Arc<CatalogSnapshot>> {
        let session = self.session()?;
        match self.catalog.snapshot() {
            Some(snapshot) if snapshot.belongs_to(session.id()) => Ok(snapshot),
            _ => Ok(self.catalog.refresh(&session).await?),
        }
    }

    /// Descriptor of `table` from the current catalog
    pub async fn get_table(&self, table: &str) -> ServiceResult<TableDescriptor> {
        let snapshot = self.schema().await?;
        snapshot
            .table(table)
            .cloned()
            .ok_or_else(|| DuetError::NotFound(format!("table '{}'", table)).into())
    }

    pub async fn foreign_key_graph(&self) -> ServiceResult<ForeignKeyGraph> {
        let snapshot = self.schema().await?;
        Ok(ForeignKeyGraph::from_snapshot(&snapshot))
    }

    /// Schema text for a natural-language-to-SQL prompt, bounded by `context.max_chars`
    pub async fn formatted_schema_context(&self, dialect: Dialect) -> ServiceResult<Arc<str>> {
        let snapshot = self.schema().await?;
        let max_chars = self.settings.read().context.max_chars;
        Ok(self
            .context_cache
            .get_or_format(&snapshot, dialect, max_chars))
    }

    pub async fn execute_batch(&self, script: &str, atomic: bool) -> ServiceResult<BatchResult> {
        self.execute_batch_cancellable(script, atomic, CancellationToken::new())
            .await
    }

    /// Run a script on the live session until it finishes or `cancel` fires.
    ///
    /// When a schema change succeeded and `catalog.refresh_after_ddl` is set,
    /// the catalog is refreshed before returning. A failed refresh keeps the
    /// previous catalog and does not fail the batch.
    #[tracing::instrument(skip(self, script, cancel), fields(script_len = script.len()))]
    pub async fn execute_batch_cancellable(
        &self,
        script: &str,
        atomic: bool,
        cancel: CancellationToken,
    ) -> ServiceResult<BatchResult> {
        let session = self.session()?;
        let (options, refresh_after_ddl) = {
            let settings = self.settings.read();
            (settings.batch_options(atomic), settings.catalog.refresh_after_ddl)
        };

        let result = BatchExecutor::new(options)
            .execute_cancellable(&session, script, cancel)
            .await?;

        if refresh_after_ddl && result.contains_ddl() {
            tracing::debug!("batch changed the schema, refreshing catalog");
            if let Err(e) = self.catalog.refresh(&session).await {
                tracing::warn!(error = %e, "catalog refresh after schema change failed");
            }
        }
        Ok(result)
    }

    /// Apply a row edit on `table`. See [`RowMutationService::update`].
    #[tracing::instrument(skip(self, before, after))]
    pub async fn update_row(
        &self,
        table: &str,
        before: &RowSnapshot,
        after: &RowSnapshot,
    ) -> ServiceResult<u64> {
        let session = self.session()?;
        let descriptor = self.get_table(table).await?;
        let mutations = self.mutations();

        let guard = session.acquire().await?;
        mutations
            .update(guard.connection(), &descriptor, before, after)
            .await
    }

    /// Delete the rows of `table` whose `key_column` is one of `ids`
    #[tracing::instrument(skip(self, ids), fields(id_count = ids.len()))]
    pub async fn delete_rows(&self, table: &str, key_column: &str, ids: &[Value]) -> ServiceResult<u64> {
        let session = self.session()?;
        let descriptor = self.get_table(table).await?;
        let mutations = self.mutations();

        let guard = session.acquire().await?;
        mutations
            .delete_rows(guard.connection(), &descriptor, key_column, ids)
            .await
    }

    /// Image of the embedded database for the caller to persist.
    ///
    /// Fails with `NothingToSave` when there are no unsaved edits.
    pub async fn read_all(&self) -> ServiceResult<Vec<u8>> {
        let session = self.session()?;
        let guard = session.acquire().await?;
        let embedded = guard.as_embedded().ok_or_else(not_embedded)?;
        Ok(embedded.read_all().await?)
    }

    /// Record that the image returned by [`read_all`](Self::read_all) was persisted
    pub async fn mark_saved(&self) -> ServiceResult<()> {
        let session = self.session()?;
        let guard = session.acquire().await?;
        guard.as_embedded().ok_or_else(not_embedded)?.mark_clean();
        Ok(())
    }

    /// Write the embedded database to `path`
    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn save_to(&self, path: &Path) -> ServiceResult<()> {
        let session = self.session()?;
        let guard = session.acquire().await?;
        let embedded = guard.as_embedded().ok_or_else(not_embedded)?;
        embedded.save_to(path).await?;
        tracing::info!("embedded database saved");
        Ok(())
    }

    fn session(&self) -> ServiceResult<Arc<Session>> {
        Ok(self.sessions.require()?)
    }

    fn mutations(&self) -> RowMutationService {
        RowMutationService::from_settings(&self.settings.read().mutation)
    }

    fn discard_catalog(&self) {
        self.catalog.invalidate();
        self.context_cache.clear();
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(DuetSettings::default())
    }
}

fn not_embedded() -> DuetError {
    DuetError::NotSupported("saving is only available for embedded databases".into())
}
