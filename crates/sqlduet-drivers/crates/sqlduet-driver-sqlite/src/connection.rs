//! SQLite connection implementation
//!
//! A session never writes to its source file directly. The database is copied
//! into an in-memory connection on open, every statement runs against that
//! copy, and changes reach disk only through [`EmbeddedPersistence`].

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection as RusqliteConnection, ErrorCode, InterruptHandle, params_from_iter};
use sqlduet_core::{
    ColumnMeta, Connection, ConnectionErrorKind, Dialect, DuetError, EmbeddedPersistence,
    EmbeddedSource, ExecuteResult, QueryCancelHandle, QueryResult, Result, Row, Savepoint,
    SavepointSupport, SchemaIntrospection, Transaction, Value,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// An interrupt issued before the statement starts stepping is lost
const INTERRUPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Cancel handle for SQLite statements.
///
/// Wraps the rusqlite `InterruptHandle`; the interrupted statement fails with
/// SQLITE_INTERRUPT, which surfaces as `DuetError::Cancelled`. SQLite clears a
/// pending interrupt once no statement is running, so repeats cannot reach a
/// later statement.
pub struct SqliteCancelHandle {
    interrupt_handle: Arc<InterruptHandle>,
}

#[async_trait]
impl QueryCancelHandle for SqliteCancelHandle {
    async fn cancel(&self) {
        tracing::debug!("interrupting SQLite statement");
        self.interrupt_handle.interrupt();
    }

    fn retry_interval(&self) -> Option<Duration> {
        Some(INTERRUPT_RETRY_INTERVAL)
    }
}

/// State shared between a connection and its open transaction
struct SqliteHandle {
    conn: Mutex<Option<RusqliteConnection>>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl SqliteHandle {
    /// Run `f` on the blocking pool so the caller's runtime keeps polling other
    /// tasks, including the one that may interrupt the statement
    async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteHandle) -> Result<T> + Send + 'static,
    {
        let handle = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime
                .spawn_blocking(move || f(&handle))
                .await
                .map_err(|e| DuetError::execution(format!("SQLite worker failed: {}", e)))?,
            Err(_) => f(&handle),
        }
    }

    async fn spawn_query(self: &Arc<Self>, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.run_blocking(move |handle| handle.query(&sql, &params))
            .await
    }

    async fn spawn_execute(self: &Arc<Self>, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.run_blocking(move |handle| handle.execute(&sql, &params))
            .await
    }

    fn with_conn<T>(&self, f: impl FnOnce(&RusqliteConnection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(DuetError::SessionClosed),
        }
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let (result, writes) = self.with_conn(|conn| run_query(conn, sql, params))?;
        if writes {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let (affected, writes) = self.with_conn(|conn| run_execute(conn, sql, params))?;
        if writes {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(ExecuteResult::new(affected))
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql).map_err(map_sqlite_error))
    }
}

/// SQLite connection over an in-memory working copy
pub struct SqliteConnection {
    handle: Arc<SqliteHandle>,
    interrupt_handle: Arc<InterruptHandle>,
    origin: Option<PathBuf>,
}

impl SqliteConnection {
    /// Open a session from an embedded source
    #[tracing::instrument]
    pub fn open(source: &EmbeddedSource) -> Result<Self> {
        let mut conn = RusqliteConnection::open_in_memory().map_err(|e| {
            DuetError::connection(
                ConnectionErrorKind::Unreachable,
                format!("failed to create in-memory database: {}", e),
            )
        })?;

        let origin = match source {
            EmbeddedSource::Empty => None,
            EmbeddedSource::Path(path) => {
                let path = expand_path(path)?;
                if !path.is_file() {
                    return Err(DuetError::connection(
                        ConnectionErrorKind::Unreachable,
                        format!("database file not found: {}", path.display()),
                    ));
                }
                restore_from(&mut conn, &path)?;
                Some(path)
            }
            EmbeddedSource::Bytes(bytes) => {
                let mut image = tempfile::NamedTempFile::new()?;
                std::io::Write::write_all(&mut image, bytes)?;
                restore_from(&mut conn, image.path())?;
                None
            }
        };

        conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| {
            DuetError::connection(
                ConnectionErrorKind::Malformed,
                format!("failed to enable foreign keys: {}", e),
            )
        })?;

        let interrupt_handle = Arc::new(conn.get_interrupt_handle());

        tracing::info!(origin = ?origin, "SQLite session opened");
        Ok(Self {
            handle: Arc::new(SqliteHandle {
                conn: Mutex::new(Some(conn)),
                dirty: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            interrupt_handle,
            origin,
        })
    }

    /// File the session was loaded from, if any
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    fn backup_to(&self, path: &Path) -> Result<()> {
        self.handle.with_conn(|conn| {
            conn.backup(rusqlite::DatabaseName::Main, path, None)
                .map_err(map_sqlite_error)
        })
    }
}

/// Copy the database at `path` into `conn`, classifying failures
fn restore_from(conn: &mut RusqliteConnection, path: &Path) -> Result<()> {
    conn.restore(
        rusqlite::DatabaseName::Main,
        path,
        None::<fn(rusqlite::backup::Progress)>,
    )
    .map_err(|e| {
        let kind = match e.sqlite_error_code() {
            Some(ErrorCode::NotADatabase) => ConnectionErrorKind::Malformed,
            _ => ConnectionErrorKind::Unreachable,
        };
        DuetError::connection(
            kind,
            format!("failed to load database '{}': {}", path.display(), e),
        )
    })
}

/// Expand `~/` to the home directory and make relative paths absolute
fn expand_path(path: &Path) -> Result<PathBuf> {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .ok_or_else(|| {
                DuetError::Configuration("unable to determine home directory".into())
            })?
            .join(rest),
        Err(_) => path.to_path_buf(),
    };

    if expanded.is_relative() {
        Ok(std::env::current_dir()?.join(expanded))
    } else {
        Ok(expanded)
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Embedded
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let result = self.handle.spawn_execute(sql, params).await?;
        tracing::debug!(affected_rows = result.affected_rows, "statement executed");
        Ok(result)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let result = self.handle.spawn_query(sql, params).await?;
        tracing::debug!(
            row_count = result.row_count(),
            execution_time_ms = result.execution_time_ms,
            "query executed successfully"
        );
        Ok(result)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning SQLite transaction");
        self.handle.execute_batch("BEGIN DEFERRED")?;
        Ok(Box::new(SqliteTransaction {
            handle: Arc::clone(&self.handle),
            finished: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.handle.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.handle.conn.lock().take();
        if let Some(conn) = conn
            && let Err((_, e)) = conn.close()
        {
            tracing::warn!(error = %e, "SQLite close reported an error; handle released anyway");
        }
        if self.handle.dirty.load(Ordering::SeqCst) {
            tracing::info!("SQLite session closed with unsaved changes discarded");
        } else {
            tracing::info!("SQLite session closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.closed.load(Ordering::SeqCst)
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }

    fn as_embedded(&self) -> Option<&dyn EmbeddedPersistence> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(SqliteCancelHandle {
            interrupt_handle: self.interrupt_handle.clone(),
        }))
    }
}

#[async_trait]
impl EmbeddedPersistence for SqliteConnection {
    fn is_dirty(&self) -> bool {
        self.handle.dirty.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self))]
    async fn read_all(&self) -> Result<Vec<u8>> {
        if !self.is_dirty() {
            return Err(DuetError::NothingToSave);
        }
        let image = tempfile::NamedTempFile::new()?;
        self.backup_to(image.path())?;
        let bytes = std::fs::read(image.path())?;
        tracing::debug!(size_bytes = bytes.len(), "database image exported");
        Ok(bytes)
    }

    fn mark_clean(&self) {
        self.handle.dirty.store(false, Ordering::SeqCst);
    }

    #[tracing::instrument(skip(self), fields(path = %path.display()))]
    async fn save_to(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let staged = tempfile::NamedTempFile::new_in(&dir)?;
        self.backup_to(staged.path())?;
        staged.persist(path).map_err(|e| DuetError::Io(e.error))?;
        self.mark_clean();
        tracing::info!("database saved");
        Ok(())
    }
}

/// SQLite transaction wrapper.
///
/// Issues raw `BEGIN DEFERRED` / `COMMIT` / `ROLLBACK` so it can share the
/// connection handle without rusqlite's borrow-scoped transaction type.
pub struct SqliteTransaction {
    handle: Arc<SqliteHandle>,
    finished: bool,
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("SQLite transaction dropped without commit or rollback, issuing automatic rollback");
            if let Err(e) = self.handle.execute_batch("ROLLBACK") {
                tracing::error!(error = %e, "automatic rollback on drop failed");
            }
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("committing SQLite transaction");
        self.finished = true;
        if let Err(e) = self.handle.execute_batch("COMMIT") {
            // A failed COMMIT leaves the transaction open
            let _ = self.handle.execute_batch("ROLLBACK");
            return Err(e);
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back SQLite transaction");
        self.finished = true;
        self.handle.execute_batch("ROLLBACK")
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing query in SQLite transaction");
        self.handle.spawn_query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing statement in SQLite transaction");
        self.handle.spawn_execute(sql, params).await
    }

    fn savepoints(&self) -> Option<&dyn SavepointSupport> {
        Some(self)
    }
}

#[async_trait]
impl SavepointSupport for SqliteTransaction {
    async fn savepoint(&self, name: &str) -> Result<Savepoint> {
        let savepoint = Savepoint::new(name)?;
        self.handle.execute_batch(&savepoint.create_sql())?;
        Ok(savepoint)
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.handle
            .execute_batch(&Savepoint::new(name)?.rollback_sql())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.handle.execute_batch(&Savepoint::new(name)?.release_sql())
    }
}

/// Run a row-returning statement. The flag reports whether it may have written.
fn run_query(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<(QueryResult, bool)> {
    let start_time = std::time::Instant::now();
    let rusqlite_params = values_to_rusqlite(params);

    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let writes = !stmt.readonly();

    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .enumerate()
        .map(|(ordinal, col)| ColumnMeta {
            name: col.name().to_string(),
            // sqlite3_column_decltype: the type from CREATE TABLE, absent for expressions
            data_type: col.decl_type().unwrap_or("DYNAMIC").to_string(),
            ordinal,
        })
        .collect();
    let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut rows = Vec::new();
    let mut query_rows = stmt
        .query(params_from_iter(rusqlite_params.iter()))
        .map_err(map_sqlite_error)?;
    while let Some(row) = query_rows.next().map_err(map_sqlite_error)? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(rusqlite_to_value(row, i)?);
        }
        rows.push(Row::new(column_names.clone(), values));
    }
    drop(query_rows);
    drop(stmt);

    // sqlite3_changes() still holds the previous write's count after a read
    let affected_rows = writes.then(|| conn.changes() as u64);

    Ok((
        QueryResult {
            id: uuid::Uuid::new_v4(),
            columns,
            rows,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
            affected_rows,
        },
        writes,
    ))
}

fn run_execute(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<(u64, bool)> {
    let rusqlite_params = values_to_rusqlite(params);
    let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
    let writes = !stmt.readonly();
    let affected = stmt
        .execute(params_from_iter(rusqlite_params.iter()))
        .map_err(map_sqlite_error)?;
    Ok((affected as u64, writes))
}

/// Translate a rusqlite failure, keeping SQLite's own message and extended result code
pub(crate) fn map_sqlite_error(e: rusqlite::Error) -> DuetError {
    if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        return DuetError::Cancelled;
    }
    match &e {
        rusqlite::Error::SqliteFailure(err, message) => DuetError::execution_with_code(
            message.clone().unwrap_or_else(|| e.to_string()),
            err.extended_code.to_string(),
        ),
        _ => DuetError::execution(e.to_string()),
    }
}

fn values_to_rusqlite(values: &[Value]) -> Vec<rusqlite::types::Value> {
    values.iter().map(value_to_rusqlite).collect()
}

fn value_to_rusqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Int16(i) => Sql::Integer(i64::from(*i)),
        Value::Int32(i) => Sql::Integer(i64::from(*i)),
        Value::Int64(i) => Sql::Integer(*i),
        Value::Float32(f) => Sql::Real(f64::from(*f)),
        Value::Float64(f) => Sql::Real(*f),
        Value::Decimal(d) => Sql::Text(d.clone()),
        Value::String(s) => Sql::Text(s.clone()),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        Value::Date(d) => Sql::Text(d.to_string()),
        Value::Time(t) => Sql::Text(t.to_string()),
        Value::DateTime(dt) => Sql::Text(dt.to_string()),
        Value::DateTimeUtc(dt) => Sql::Text(dt.to_rfc3339()),
        Value::Json(j) => Sql::Text(j.to_string()),
        Value::Uuid(u) => Sql::Text(u.to_string()),
        Value::Array(items) => Sql::Text(
            serde_json::Value::Array(items.iter().map(value_to_json).collect()).to_string(),
        ),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int16(i) => (*i).into(),
        Value::Int32(i) => (*i).into(),
        Value::Int64(i) => (*i).into(),
        Value::Float64(f) => serde_json::json!(f),
        Value::Float32(f) => serde_json::json!(f),
        Value::Json(j) => j.clone(),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        other => serde_json::Value::String(other.to_string()),
    }
}

/// Read one column. BLOBs stay binary so they compare equal when bound back.
fn rusqlite_to_value(row: &rusqlite::Row, idx: usize) -> Result<Value> {
    use rusqlite::types::ValueRef;

    let value_ref = row.get_ref(idx).map_err(map_sqlite_error)?;
    Ok(match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    })
}
