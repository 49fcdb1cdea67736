//! PostgreSQL connection implementation

use async_trait::async_trait;
use futures::TryStreamExt;
use postgres_native_tls::MakeTlsConnector;
use sqlduet_core::{
    ColumnMeta, Connection, ConnectionErrorKind, Dialect, DuetError, ExecuteResult,
    NetworkDescriptor, QueryCancelHandle, QueryResult, Result, Row, Savepoint, SavepointSupport,
    SchemaIntrospection, Transaction, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Client, NoTls, Statement};

use crate::tls;
use crate::value::{PgValue, postgres_to_value};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancel handle for PostgreSQL queries.
///
/// Sends a cancel request over a separate connection, so it works while the
/// session's client is busy. The server cancels whatever the session runs when
/// the request arrives, so callers send one request and wait for it.
pub struct PostgresCancelHandle {
    cancel_token: CancelToken,
    tls: Option<MakeTlsConnector>,
}

#[async_trait]
impl QueryCancelHandle for PostgresCancelHandle {
    async fn cancel(&self) {
        tracing::debug!("sending cancel request to PostgreSQL server");
        let sent = match &self.tls {
            Some(tls) => self.cancel_token.cancel_query(tls.clone()).await,
            None => self.cancel_token.cancel_query(NoTls).await,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to cancel PostgreSQL query");
        }
    }
}

/// State shared between a connection and its open transaction
struct PgShared {
    client: Mutex<Option<Client>>,
    /// Set when a transaction is dropped unfinished; the next statement rolls it back first
    abandoned_transaction: AtomicBool,
}

impl PgShared {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DuetError::SessionClosed)?;
        self.settle_abandoned(client).await;
        run_query(client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DuetError::SessionClosed)?;
        self.settle_abandoned(client).await;
        run_execute(client, sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DuetError::SessionClosed)?;
        self.settle_abandoned(client).await;
        client.batch_execute(sql).await.map_err(map_pg_error)
    }

    /// Statements issued by a live transaction, skipping the abandoned-transaction check
    async fn batch_execute_in_transaction(&self, sql: &str) -> Result<()> {
        let guard = self.client.lock().await;
        let client = guard.as_ref().ok_or(DuetError::SessionClosed)?;
        client.batch_execute(sql).await.map_err(map_pg_error)
    }

    async fn settle_abandoned(&self, client: &Client) {
        if self.abandoned_transaction.swap(false, Ordering::SeqCst) {
            tracing::debug!("rolling back abandoned PostgreSQL transaction");
            if let Err(e) = client.batch_execute("ROLLBACK").await {
                tracing::error!(error = %format_postgres_error(&e), "rollback of abandoned transaction failed");
            }
        }
    }
}

/// PostgreSQL connection wrapper
pub struct PostgresConnection {
    shared: Arc<PgShared>,
    cancel_token: CancelToken,
    tls: Option<MakeTlsConnector>,
    connection_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PostgresConnection {
    /// Connect to a PostgreSQL server.
    ///
    /// Must be called from inside a Tokio runtime; the connection's I/O task
    /// is spawned onto that runtime.
    pub async fn connect(descriptor: &NetworkDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            DuetError::Configuration("the PostgreSQL driver requires a Tokio runtime".into())
        })?;

        tracing::info!(
            host = %descriptor.host,
            port = %descriptor.port,
            database = %descriptor.database,
            ssl_mode = %descriptor.ssl_mode,
            "connecting to PostgreSQL database"
        );

        let mut config = tokio_postgres::Config::new();
        config
            .host(&descriptor.host)
            .port(descriptor.port)
            .dbname(&descriptor.database)
            .application_name("sqlduet")
            .connect_timeout(CONNECT_TIMEOUT)
            .ssl_mode(tls::negotiation_mode(descriptor.ssl_mode));

        // Like libpq, default to the operating-system user name
        if let Some(user) = descriptor.user.clone().or_else(|| std::env::var("USER").ok()) {
            config.user(&user);
        }
        if let Some(password) = &descriptor.password {
            config.password(password);
        }

        let (client, tls, connection_task) = if descriptor.ssl_mode.uses_tls() {
            let connector = tls::build_connector(descriptor).map_err(|e| {
                DuetError::connection(ConnectionErrorKind::Malformed, e.to_string())
            })?;
            let (client, connection) = config
                .connect(connector.clone())
                .await
                .map_err(classify_connect_error)?;
            let task = runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            (client, Some(connector), task)
        } else {
            let (client, connection) = config.connect(NoTls).await.map_err(classify_connect_error)?;
            let task = runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            (client, None, task)
        };

        tracing::info!(
            host = %descriptor.host,
            database = %descriptor.database,
            "PostgreSQL connection established"
        );

        Ok(Self {
            cancel_token: client.cancel_token(),
            shared: Arc::new(PgShared {
                client: Mutex::new(Some(client)),
                abandoned_transaction: AtomicBool::new(false),
            }),
            tls,
            connection_task: parking_lot::Mutex::new(Some(connection_task)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Sort a failed connect into unreachable, rejected credentials, or a bad descriptor
fn classify_connect_error(error: tokio_postgres::Error) -> DuetError {
    let message = format_postgres_error(&error);
    let kind = match error.code() {
        Some(code) if *code == SqlState::INVALID_PASSWORD => ConnectionErrorKind::AuthRejected,
        Some(code) if *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION => {
            ConnectionErrorKind::AuthRejected
        }
        Some(_) => ConnectionErrorKind::Unreachable,
        None => {
            let text = error.to_string();
            if text.contains("password missing") {
                ConnectionErrorKind::AuthRejected
            } else if text.contains("invalid configuration") {
                ConnectionErrorKind::Malformed
            } else {
                ConnectionErrorKind::Unreachable
            }
        }
    };
    tracing::warn!(kind = %kind, error = %message, "PostgreSQL connection failed");
    DuetError::connection(kind, message)
}

/// Render a server error with its detail, hint and column, when present
pub(crate) fn format_postgres_error(error: &tokio_postgres::Error) -> String {
    let Some(db_error) = error.as_db_error() else {
        return error.to_string();
    };

    let mut message = db_error.message().to_string();

    if let Some(detail) = db_error.detail()
        && !detail.trim().is_empty()
    {
        message.push_str(&format!(" (detail: {})", detail));
    }

    if let Some(hint) = db_error.hint()
        && !hint.trim().is_empty()
    {
        message.push_str(&format!(" (hint: {})", hint));
    }

    if let Some(column) = db_error.column()
        && !column.trim().is_empty()
    {
        message.push_str(&format!(" (column: {})", column));
    }

    message
}

/// Translate a statement failure, keeping the SQLSTATE as the error code
pub(crate) fn map_pg_error(error: tokio_postgres::Error) -> DuetError {
    match error.code() {
        Some(code) if *code == SqlState::QUERY_CANCELED => DuetError::Cancelled,
        Some(code) => DuetError::execution_with_code(format_postgres_error(&error), code.code()),
        None if error.is_closed() => DuetError::SessionClosed,
        None => DuetError::execution(format_postgres_error(&error)),
    }
}

/// Coerce parameters to the types the server inferred while preparing
fn bind_params(statement: &Statement, params: &[Value]) -> Vec<PgValue> {
    let param_types = statement.params();
    params
        .iter()
        .enumerate()
        .map(|(i, value)| match param_types.get(i) {
            Some(target_type) => PgValue::from_value_for_type(value, target_type),
            None => PgValue::from_value(value),
        })
        .collect()
}

async fn run_query(client: &Client, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let start_time = std::time::Instant::now();

    let statement = client.prepare(sql).await.map_err(map_pg_error)?;
    let pg_params = bind_params(&statement, params);
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let stream = client
        .query_raw(&statement, param_refs.iter().copied())
        .await
        .map_err(map_pg_error)?;
    futures::pin_mut!(stream);
    let mut pg_rows = Vec::new();
    while let Some(pg_row) = stream.try_next().await.map_err(map_pg_error)? {
        pg_rows.push(pg_row);
    }
    // From the command tag; `None` for plain SELECTs
    let affected_rows = stream.rows_affected();

    // Taken from the prepared statement so empty result sets still carry columns
    let columns: Vec<ColumnMeta> = statement
        .columns()
        .iter()
        .enumerate()
        .map(|(ordinal, col)| ColumnMeta {
            name: col.name().to_string(),
            data_type: col.type_().name().to_string(),
            ordinal,
        })
        .collect();
    let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut rows = Vec::with_capacity(pg_rows.len());
    for pg_row in &pg_rows {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(postgres_to_value(pg_row, idx)?);
        }
        rows.push(Row::new(column_names.clone(), values));
    }

    Ok(QueryResult {
        id: uuid::Uuid::new_v4(),
        columns,
        rows,
        execution_time_ms: start_time.elapsed().as_millis() as u64,
        affected_rows,
    })
}

async fn run_execute(client: &Client, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
    let statement = client.prepare(sql).await.map_err(map_pg_error)?;
    let pg_params = bind_params(&statement, params);
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let affected = client
        .execute(&statement, &param_refs)
        .await
        .map_err(map_pg_error)?;
    Ok(ExecuteResult::new(affected))
}

#[async_trait]
impl Connection for PostgresConnection {
    fn driver_name(&self) -> &str {
        "postgresql"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Networked
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        let result = self.shared.execute(sql, params).await?;
        tracing::debug!(affected_rows = result.affected_rows, "statement executed");
        Ok(result)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let result = self.shared.query(sql, params).await?;
        tracing::debug!(
            row_count = result.row_count(),
            execution_time_ms = result.execution_time_ms,
            "query executed successfully"
        );
        Ok(result)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning PostgreSQL transaction");
        self.shared.batch_execute("BEGIN").await?;
        Ok(Box::new(PostgresTransaction {
            shared: Arc::clone(&self.shared),
            finished: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the client ends the connection task
        self.shared.client.lock().await.take();
        if let Some(task) = self.connection_task.lock().take() {
            task.abort();
        }
        tracing::info!("PostgreSQL session closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(PostgresCancelHandle {
            cancel_token: self.cancel_token.clone(),
            tls: self.tls.clone(),
        }))
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if let Some(task) = self.connection_task.lock().take() {
            task.abort();
        }
    }
}

/// PostgreSQL transaction wrapper
pub struct PostgresTransaction {
    shared: Arc<PgShared>,
    finished: bool,
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("PostgreSQL transaction dropped without commit or rollback, rolling back before the next statement");
            self.shared.abandoned_transaction.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("committing PostgreSQL transaction");
        self.finished = true;
        self.shared.batch_execute_in_transaction("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        tracing::debug!("rolling back PostgreSQL transaction");
        self.finished = true;
        self.shared.batch_execute_in_transaction("ROLLBACK").await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing query in PostgreSQL transaction");
        self.shared.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing statement in PostgreSQL transaction");
        self.shared.execute(sql, params).await
    }

    fn savepoints(&self) -> Option<&dyn SavepointSupport> {
        Some(self)
    }
}

#[async_trait]
impl SavepointSupport for PostgresTransaction {
    async fn savepoint(&self, name: &str) -> Result<Savepoint> {
        let savepoint = Savepoint::new(name)?;
        self.shared
            .batch_execute_in_transaction(&savepoint.create_sql())
            .await?;
        Ok(savepoint)
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.shared
            .batch_execute_in_transaction(&Savepoint::new(name)?.rollback_sql())
            .await
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.shared
            .batch_execute_in_transaction(&Savepoint::new(name)?.release_sql())
            .await
    }
}
