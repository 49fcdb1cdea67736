//! Common test utilities and mocks

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlduet_core::{
    Connection, Dialect, DuetError, ExecuteResult, QueryResult, Result, Savepoint,
    SavepointSupport, Transaction, Value,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// A statement as received by the mock, with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct MockState {
    log: Vec<LoggedStatement>,
    /// Affected-row counts handed out in order; 1 once exhausted
    affected: VecDeque<u64>,
}

/// Mock connection for testing service-layer logic without a real database.
///
/// Every statement, including transaction control, is appended to a shared
/// log. Mutating statements return scripted affected-row counts.
pub struct MockConnection {
    pub dialect: Dialect,
    pub should_fail: bool,
    pub transactional_ddl: bool,
    pub savepoints: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            should_fail: false,
            transactional_ddl: true,
            savepoints: true,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Affected-row counts for the next mutating statements, in order
    pub fn with_affected(self, counts: &[u64]) -> Self {
        self.state.lock().affected.extend(counts.iter().copied());
        self
    }

    pub fn without_transactional_ddl(mut self) -> Self {
        self.transactional_ddl = false;
        self
    }

    pub fn without_savepoints(mut self) -> Self {
        self.savepoints = false;
        self
    }

    pub fn log(&self) -> Vec<LoggedStatement> {
        self.state.lock().log.clone()
    }

    /// Statement texts only
    pub fn sql_log(&self) -> Vec<String> {
        self.state.lock().log.iter().map(|s| s.sql.clone()).collect()
    }

    /// Start a transaction whose statements land in the same log
    pub fn transaction(&self) -> MockTransaction {
        record(&self.state, "BEGIN", &[]);
        MockTransaction {
            should_fail: self.should_fail,
            savepoints: self.savepoints,
            state: Arc::clone(&self.state),
        }
    }
}

fn record(state: &Mutex<MockState>, sql: &str, params: &[Value]) {
    state.lock().log.push(LoggedStatement {
        sql: sql.to_string(),
        params: params.to_vec(),
    });
}

fn run_execute(state: &Mutex<MockState>, should_fail: bool, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
    record(state, sql, params);
    if should_fail {
        return Err(DuetError::execution_with_code("mock failure", "XX000"));
    }
    let affected = state.lock().affected.pop_front().unwrap_or(1);
    Ok(ExecuteResult::new(affected))
}

#[async_trait]
impl Connection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        run_execute(&self.state, self.should_fail, sql, params)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        record(&self.state, sql, params);
        if self.should_fail {
            return Err(DuetError::execution("mock failure"));
        }
        Ok(QueryResult::empty())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.transaction()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional_ddl
    }
}

pub struct MockTransaction {
    should_fail: bool,
    savepoints: bool,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        record(&self.state, "COMMIT", &[]);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        record(&self.state, "ROLLBACK", &[]);
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        record(&self.state, sql, params);
        Ok(QueryResult::empty())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
        run_execute(&self.state, self.should_fail, sql, params)
    }

    fn savepoints(&self) -> Option<&dyn SavepointSupport> {
        if self.savepoints { Some(self) } else { None }
    }
}

#[async_trait]
impl SavepointSupport for MockTransaction {
    async fn savepoint(&self, name: &str) -> Result<Savepoint> {
        let savepoint = Savepoint::new(name)?;
        record(&self.state, &savepoint.create_sql(), &[]);
        Ok(savepoint)
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        record(&self.state, &Savepoint::new(name)?.rollback_sql(), &[]);
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        record(&self.state, &Savepoint::new(name)?.release_sql(), &[]);
        Ok(())
    }
}

/// Replace generated savepoint names so logs can be compared literally
pub fn normalize_savepoints(log: Vec<String>) -> Vec<String> {
    log.into_iter()
        .map(|sql| match sql.find("sqlduet_mutation_") {
            Some(pos) => format!("{}sp", &sql[..pos]),
            None => sql,
        })
        .collect()
}

/// Initialize logging for tests if not already initialized
pub fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("sqlduet=debug".parse().unwrap()),
            )
            .with_test_writer()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
