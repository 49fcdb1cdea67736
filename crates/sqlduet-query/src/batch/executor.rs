//! Batch executor implementation
//!
//! Runs a script statement by statement on one session, either inside a single
//! transaction (atomic) or with each statement committing on its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlduet_connection::Session;
use sqlduet_core::dialect;
use sqlduet_core::{
    Connection, Dialect, DuetError, QueryCancelHandle, QueryResult, Result, Transaction,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::split_statements;

/// Configuration options for batch execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Run every statement inside one transaction and abort on the first failure
    pub atomic: bool,
    /// Timeout per statement in milliseconds (0 = no timeout)
    pub statement_timeout_ms: u64,
}

impl BatchOptions {
    /// Create new batch options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// All-or-nothing execution
    pub fn atomic() -> Self {
        Self {
            atomic: true,
            ..Self::default()
        }
    }

    /// Each statement commits on its own; failures do not stop the batch
    pub fn independent() -> Self {
        Self {
            atomic: false,
            ..Self::default()
        }
    }

    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Set statement timeout in milliseconds
    pub fn with_statement_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.statement_timeout_ms = timeout_ms;
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        (self.statement_timeout_ms > 0).then(|| Duration::from_millis(self.statement_timeout_ms))
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            atomic: true,
            statement_timeout_ms: 0,
        }
    }
}

/// Final state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// Every statement succeeded and its effects are committed
    Committed,
    /// Atomic batch aborted; none of its effects survive
    RolledBack,
    /// Independent batch in which at least one statement failed or was cancelled
    PartiallyApplied,
}

/// Status of a single executed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementStatus {
    /// Statement executed successfully
    Success,
    /// Statement failed with an error
    Failed,
    /// Statement was interrupted by the caller
    Cancelled,
}

/// Error information for a failed statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementError {
    /// Error message, verbatim from the backend
    pub message: String,
    /// Error code (SQLSTATE or SQLite result code), if the backend supplied one
    pub code: Option<String>,
}

impl StatementError {
    /// Create a new statement error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create a statement error with a code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<&DuetError> for StatementError {
    fn from(err: &DuetError) -> Self {
        match err {
            DuetError::Execution { message, code, .. } => Self {
                message: message.clone(),
                code: code.clone(),
            },
            other => Self::new(other.to_string()),
        }
    }
}

impl From<DuetError> for StatementError {
    fn from(err: DuetError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for StatementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{}] {}", code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Something the caller should know about even though the batch ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchWarning {
    /// A schema statement in an atomic batch is outside the transaction's control,
    /// so the batch cannot be fully undone
    NonTransactionalDdl {
        statement_index: usize,
        reason: String,
    },
}

impl std::fmt::Display for BatchWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonTransactionalDdl {
                statement_index,
                reason,
            } => write!(f, "statement {} is not transactional: {}", statement_index + 1, reason),
        }
    }
}

/// Outcome of one executed statement
#[derive(Debug, Clone)]
pub struct StatementResult {
    /// Index of this statement in the script (0-based)
    pub index: usize,
    /// The SQL that was executed
    pub sql: String,
    /// Status of execution
    pub status: StatementStatus,
    /// Rows changed; for `RETURNING` statements, the number of rows returned
    pub rows_affected: u64,
    /// Result set, for statements that return rows
    pub query_result: Option<QueryResult>,
    /// Error details (if status is not Success)
    pub error: Option<StatementError>,
    pub elapsed: Duration,
    /// Whether the statement changes schema
    pub is_ddl: bool,
}

impl StatementResult {
    fn success(
        index: usize,
        sql: String,
        rows_affected: u64,
        query_result: Option<QueryResult>,
        elapsed: Duration,
    ) -> Self {
        let is_ddl = dialect::is_ddl(&sql);
        Self {
            index,
            sql,
            status: StatementStatus::Success,
            rows_affected,
            query_result,
            error: None,
            elapsed,
            is_ddl,
        }
    }

    fn unsuccessful(
        index: usize,
        sql: String,
        status: StatementStatus,
        error: StatementError,
        elapsed: Duration,
    ) -> Self {
        let is_ddl = dialect::is_ddl(&sql);
        Self {
            index,
            sql,
            status,
            rows_affected: 0,
            query_result: None,
            error: Some(error),
            elapsed,
            is_ddl,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StatementStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == StatementStatus::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == StatementStatus::Cancelled
    }

    /// Rows in the result set, if the statement returned one
    pub fn row_count(&self) -> Option<usize> {
        self.query_result.as_ref().map(QueryResult::row_count)
    }
}

/// Result of a whole batch
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Executed statements in source order. Statements never reached are absent.
    pub statements: Vec<StatementResult>,
    pub overall_success: bool,
    pub state: BatchState,
    /// Index of the statement that aborted an atomic batch
    pub aborted_at: Option<usize>,
    pub warnings: Vec<BatchWarning>,
    /// The error that ended the batch early, if any
    pub terminal_error: Option<StatementError>,
    /// Whether the caller cancelled the batch
    pub cancelled: bool,
    pub total_elapsed: Duration,
}

impl BatchResult {
    /// Result of a script with no statements
    pub fn empty() -> Self {
        Self {
            statements: Vec::new(),
            overall_success: true,
            state: BatchState::Committed,
            aborted_at: None,
            warnings: Vec::new(),
            terminal_error: None,
            cancelled: false,
            total_elapsed: Duration::ZERO,
        }
    }

    /// Get the number of executed statements
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn success_count(&self) -> usize {
        self.statements.iter().filter(|s| s.is_success()).count()
    }

    /// Statements that failed or were cancelled
    pub fn failed_statements(&self) -> Vec<&StatementResult> {
        self.statements.iter().filter(|s| !s.is_success()).collect()
    }

    /// Get the total number of rows affected across all statements
    pub fn total_affected_rows(&self) -> u64 {
        self.statements.iter().map(|s| s.rows_affected).sum()
    }

    /// Whether a schema change took effect
    pub fn contains_ddl(&self) -> bool {
        self.state != BatchState::RolledBack
            && self.statements.iter().any(|s| s.is_ddl && s.is_success())
    }
}

/// Why a running statement was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    TimedOut,
}

/// Watchdog lifecycle, shared between the watchdog task and the statement runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Armed,
    Fired(Interruption),
    Stopped,
}

/// Interrupts one running statement on cancellation or timeout
struct Watchdog {
    task: JoinHandle<()>,
    state: Arc<Mutex<WatchState>>,
    retries: bool,
}

impl Watchdog {
    /// Stop watching once the statement has returned.
    ///
    /// A one-shot cancel request already under way is awaited, so it has been
    /// delivered before the next statement starts.
    async fn stop(self) -> Option<Interruption> {
        let fired = {
            let mut state = self.state.lock();
            match *state {
                WatchState::Fired(reason) => Some(reason),
                WatchState::Armed | WatchState::Stopped => {
                    *state = WatchState::Stopped;
                    None
                }
            }
        };
        if fired.is_none() || self.retries {
            self.task.abort();
        }
        let _ = self.task.await;
        fired
    }
}

/// Where statements run: the bare connection or an open transaction
#[derive(Clone, Copy)]
enum Target<'a> {
    Connection(&'a dyn Connection),
    Transaction(&'a dyn Transaction),
}

impl Target<'_> {
    /// Run one statement, through the row path when it produces a result set
    async fn run(self, sql: &str) -> Result<(u64, Option<QueryResult>)> {
        if dialect::returns_rows(sql) {
            let result = match self {
                Target::Connection(conn) => conn.query(sql, &[]).await?,
                Target::Transaction(tx) => tx.query(sql, &[]).await?,
            };
            let rows_affected = if dialect::modifies_data(sql) {
                result
                    .affected_rows
                    .unwrap_or(result.row_count() as u64)
            } else {
                0
            };
            Ok((rows_affected, Some(result)))
        } else {
            let result = match self {
                Target::Connection(conn) => conn.execute(sql, &[]).await?,
                Target::Transaction(tx) => tx.execute(sql, &[]).await?,
            };
            Ok((result.affected_rows, None))
        }
    }
}

/// Executes scripts on a session, one statement at a time
#[derive(Debug, Clone, Default)]
pub struct BatchExecutor {
    options: BatchOptions,
}

impl BatchExecutor {
    /// Create a new batch executor with the given options
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    /// Create a batch executor with default options
    pub fn with_defaults() -> Self {
        Self::new(BatchOptions::default())
    }

    /// Get the current options
    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Run `script` with exclusive use of `session`
    pub async fn execute(&self, session: &Session, script: &str) -> Result<BatchResult> {
        self.execute_cancellable(session, script, CancellationToken::new())
            .await
    }

    /// Run `script` with exclusive use of `session`, stopping when `cancel` fires.
    ///
    /// Parse errors are reported before the session is acquired.
    pub async fn execute_cancellable(
        &self,
        session: &Session,
        script: &str,
        cancel: CancellationToken,
    ) -> Result<BatchResult> {
        let statements = split_statements(script, session.dialect())?;
        let guard = session.acquire().await?;
        self.run_statements(guard.connection(), statements, &cancel)
            .await
    }

    /// Run `script` on a connection the caller already holds exclusively
    pub async fn execute_on(
        &self,
        conn: &dyn Connection,
        script: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        let statements = split_statements(script, conn.dialect())?;
        self.run_statements(conn, statements, cancel).await
    }

    #[tracing::instrument(
        skip(self, conn, statements, cancel),
        fields(atomic = self.options.atomic, statement_count = statements.len())
    )]
    async fn run_statements(
        &self,
        conn: &dyn Connection,
        statements: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        if statements.is_empty() {
            tracing::debug!("empty script, nothing to execute");
            return Ok(BatchResult::empty());
        }
        if conn.is_closed() {
            return Err(DuetError::SessionClosed);
        }

        let batch_start = Instant::now();
        let mut result = if self.options.atomic {
            self.execute_atomic(conn, statements, cancel).await?
        } else {
            self.execute_independent(conn, statements, cancel).await
        };
        result.total_elapsed = batch_start.elapsed();

        tracing::info!(
            state = ?result.state,
            executed = result.statement_count(),
            failed = result.failed_statements().len(),
            cancelled = result.cancelled,
            elapsed_ms = result.total_elapsed.as_millis() as u64,
            "batch finished"
        );
        Ok(result)
    }

    /// One transaction around the whole script; the first failure rolls everything back
    async fn execute_atomic(
        &self,
        conn: &dyn Connection,
        statements: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        if let Some(index) = statements
            .iter()
            .position(|sql| dialect::is_transaction_control(sql))
        {
            tracing::warn!(statement_index = index, "atomic batch rejected: script controls its own transaction");
            return Err(DuetError::execution(format!(
                "statement {} begins or ends a transaction, which an atomic batch manages itself; \
                 remove it or run the script non-atomically",
                index + 1
            ))
            .at_statement(index));
        }

        let warnings = non_transactional_warnings(conn, &statements);
        for warning in &warnings {
            tracing::warn!(%warning, "atomic batch contains a non-transactional statement");
        }

        let cancel_handle = conn.cancel_handle();
        let tx = conn.begin_transaction().await?;

        let mut results = Vec::with_capacity(statements.len());
        let mut aborted_at = None;
        let mut terminal_error = None;
        let mut cancelled = false;

        for (index, sql) in statements.into_iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                terminal_error = Some(StatementError::new(DuetError::Cancelled.to_string()));
                break;
            }

            let outcome = self
                .execute_single(
                    Target::Transaction(tx.as_ref()),
                    index,
                    sql,
                    cancel,
                    cancel_handle.as_ref(),
                )
                .await;

            if !outcome.is_success() {
                tracing::warn!(
                    statement_index = index,
                    error = ?outcome.error,
                    "statement failed, rolling back batch"
                );
                cancelled = outcome.is_cancelled();
                aborted_at = Some(index);
                terminal_error = outcome.error.clone();
                results.push(outcome);
                break;
            }
            results.push(outcome);
        }

        // Results collected so far are reported even when ending the transaction fails
        let state = if aborted_at.is_some() || cancelled {
            match tx.rollback().await {
                Ok(()) => BatchState::RolledBack,
                Err(e) => {
                    tracing::error!(error = %e, "rollback failed; earlier statements may still be applied");
                    terminal_error = Some(StatementError::new(format!("rollback failed: {}", e)));
                    BatchState::PartiallyApplied
                }
            }
        } else {
            match tx.commit().await {
                Ok(()) => BatchState::Committed,
                Err(e) => {
                    tracing::error!(error = %e, "commit failed; transaction rolled back");
                    terminal_error = Some(e.into());
                    BatchState::RolledBack
                }
            }
        };

        Ok(BatchResult {
            statements: results,
            overall_success: state == BatchState::Committed,
            state,
            aborted_at,
            warnings,
            terminal_error,
            cancelled,
            total_elapsed: Duration::ZERO,
        })
    }

    /// Each statement commits on its own; failures are recorded and execution continues
    async fn execute_independent(
        &self,
        conn: &dyn Connection,
        statements: Vec<String>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let cancel_handle = conn.cancel_handle();
        let mut results = Vec::with_capacity(statements.len());
        let mut terminal_error = None;
        let mut cancelled = false;

        for (index, sql) in statements.into_iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                terminal_error = Some(StatementError::new(DuetError::Cancelled.to_string()));
                break;
            }

            let outcome = self
                .execute_single(
                    Target::Connection(conn),
                    index,
                    sql,
                    cancel,
                    cancel_handle.as_ref(),
                )
                .await;

            if outcome.is_failed() {
                tracing::warn!(statement_index = index, error = ?outcome.error, "statement failed, continuing");
            }
            let stop = outcome.is_cancelled();
            if stop {
                cancelled = true;
                terminal_error = outcome.error.clone();
            }
            results.push(outcome);
            if stop {
                break;
            }
        }

        let any_failed = results.iter().any(|r: &StatementResult| !r.is_success());
        let state = if any_failed || cancelled {
            BatchState::PartiallyApplied
        } else {
            BatchState::Committed
        };

        BatchResult {
            statements: results,
            overall_success: state == BatchState::Committed,
            state,
            aborted_at: None,
            warnings: Vec::new(),
            terminal_error,
            cancelled,
            total_elapsed: Duration::ZERO,
        }
    }

    /// Execute a single statement under the timeout and the caller's cancellation
    async fn execute_single(
        &self,
        target: Target<'_>,
        index: usize,
        sql: String,
        cancel: &CancellationToken,
        cancel_handle: Option<&Arc<dyn QueryCancelHandle>>,
    ) -> StatementResult {
        let start = Instant::now();
        let watchdog = self.spawn_watchdog(cancel, cancel_handle);

        let result = target.run(&sql).await;

        let interruption = match watchdog {
            Some(watchdog) => watchdog.stop().await,
            None => None,
        };
        let elapsed = start.elapsed();

        match result {
            Ok((rows_affected, query_result)) => {
                tracing::debug!(statement_index = index, rows_affected, "statement succeeded");
                StatementResult::success(index, sql, rows_affected, query_result, elapsed)
            }
            Err(e) if e.is_cancelled() && interruption == Some(Interruption::TimedOut) => {
                let error = StatementError::new(format!(
                    "statement exceeded the {} ms timeout and was cancelled",
                    self.options.statement_timeout_ms
                ));
                StatementResult::unsuccessful(index, sql, StatementStatus::Failed, error, elapsed)
            }
            Err(e) if e.is_cancelled() => {
                StatementResult::unsuccessful(index, sql, StatementStatus::Cancelled, e.into(), elapsed)
            }
            Err(e) => {
                let e = e.at_statement(index);
                StatementResult::unsuccessful(index, sql, StatementStatus::Failed, e.into(), elapsed)
            }
        }
    }

    /// Fire the backend cancel handle when the caller cancels or the timeout elapses.
    ///
    /// Runs as its own task so it keeps running while the statement is awaited.
    fn spawn_watchdog(
        &self,
        cancel: &CancellationToken,
        cancel_handle: Option<&Arc<dyn QueryCancelHandle>>,
    ) -> Option<Watchdog> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let Some(handle) = cancel_handle.cloned() else {
            tracing::debug!("backend cannot interrupt statements; cancellation applies between statements");
            return None;
        };
        let cancel = cancel.clone();
        let timeout = self.options.statement_timeout();
        let state = Arc::new(Mutex::new(WatchState::Armed));
        let retries = handle.retry_interval().is_some();

        let task = runtime.spawn({
            let state = Arc::clone(&state);
            async move {
                let deadline = async {
                    match timeout {
                        Some(timeout) => tokio::time::sleep(timeout).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                let reason = tokio::select! {
                    _ = cancel.cancelled() => Interruption::Cancelled,
                    _ = deadline => Interruption::TimedOut,
                };
                {
                    let mut state = state.lock();
                    if *state == WatchState::Stopped {
                        return;
                    }
                    *state = WatchState::Fired(reason);
                }
                tracing::info!(?reason, "interrupting running statement");

                match handle.retry_interval() {
                    Some(interval) => loop {
                        handle.cancel().await;
                        tokio::time::sleep(interval).await;
                    },
                    None => handle.cancel().await,
                }
            }
        });

        Some(Watchdog {
            task,
            state,
            retries,
        })
    }
}

/// Warnings for statements that an atomic batch cannot undo
fn non_transactional_warnings(conn: &dyn Connection, statements: &[String]) -> Vec<BatchWarning> {
    let dialect: Dialect = conn.dialect();
    statements
        .iter()
        .enumerate()
        .filter_map(|(statement_index, sql)| {
            let reason = match dialect.non_transactional_reason(sql) {
                Some(reason) => reason.to_string(),
                None if dialect::is_ddl(sql) && !conn.supports_transactional_ddl() => format!(
                    "{} does not roll back schema changes",
                    conn.driver_name()
                ),
                None => return None,
            };
            Some(BatchWarning::NonTransactionalDdl {
                statement_index,
                reason,
            })
        })
        .collect()
}
