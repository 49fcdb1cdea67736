//! A live backend session and its single in-flight operation gate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlduet_core::{
    Connection, ConnectionDescriptor, Dialect, DuetError, QueryCancelHandle, Result,
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// What happens when an operation arrives while another one holds the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the running operation to finish
    #[default]
    Queue,
    /// Fail immediately with `DuetError::Busy`
    Reject,
}

/// Summary of the live session, safe to log or show
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub identity: String,
    pub dialect: Dialect,
    pub driver: String,
    pub opened_at: DateTime<Utc>,
    pub busy: bool,
    /// Unsaved edits; `None` for networked sessions, which write through
    pub dirty: Option<bool>,
}

/// One open backend connection.
///
/// Statements never interleave on the underlying connection: every caller
/// goes through [`Session::acquire`] and holds the returned guard for as long
/// as it needs exclusive use, a whole batch included.
pub struct Session {
    id: Uuid,
    identity: String,
    dialect: Dialect,
    opened_at: DateTime<Utc>,
    conn: Arc<dyn Connection>,
    gate: Mutex<()>,
    busy_policy: BusyPolicy,
}

impl Session {
    pub fn new(
        conn: Arc<dyn Connection>,
        descriptor: &ConnectionDescriptor,
        busy_policy: BusyPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: descriptor.display_identity(),
            dialect: conn.dialect(),
            opened_at: Utc::now(),
            conn,
            gate: Mutex::new(()),
            busy_policy,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Credential-free description of what the session is connected to
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn busy_policy(&self) -> BusyPolicy {
        self.busy_policy
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Whether an operation currently holds the session
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Cancel handle for whatever statement is running, if the backend supports it.
    ///
    /// Usable without holding the gate.
    pub fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        self.conn.cancel_handle()
    }

    /// Take exclusive use of the session, waiting or failing per the busy policy
    #[tracing::instrument(skip(self), fields(session_id = %self.id))]
    pub async fn acquire(&self) -> Result<SessionGuard<'_>> {
        if self.is_closed() {
            return Err(DuetError::SessionClosed);
        }

        let permit = match self.busy_policy {
            BusyPolicy::Queue => self.gate.lock().await,
            BusyPolicy::Reject => self.gate.try_lock().map_err(|_| {
                tracing::debug!("session busy, rejecting operation");
                DuetError::Busy
            })?,
        };

        // the session may have been closed while we waited
        if self.is_closed() {
            return Err(DuetError::SessionClosed);
        }

        Ok(SessionGuard {
            _permit: permit,
            conn: &self.conn,
        })
    }

    /// Close the backend connection once any running operation has finished.
    ///
    /// Embedded sessions discard unsaved edits; nothing is flushed implicitly.
    #[tracing::instrument(skip(self), fields(session_id = %self.id, identity = %self.identity))]
    pub async fn close(&self) -> Result<()> {
        let _permit = self.gate.lock().await;
        self.conn.close().await
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            identity: self.identity.clone(),
            dialect: self.dialect,
            driver: self.conn.driver_name().to_string(),
            opened_at: self.opened_at,
            busy: self.is_busy(),
            dirty: self.conn.as_embedded().map(|e| e.is_dirty()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("dialect", &self.dialect)
            .field("busy_policy", &self.busy_policy)
            .finish_non_exhaustive()
    }
}

/// Exclusive use of a session; released on drop
pub struct SessionGuard<'a> {
    _permit: MutexGuard<'a, ()>,
    conn: &'a Arc<dyn Connection>,
}

impl SessionGuard<'_> {
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Shared handle to the connection, for work that must outlive a borrow
    pub fn connection_arc(&self) -> Arc<dyn Connection> {
        Arc::clone(self.conn)
    }
}

impl std::ops::Deref for SessionGuard<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn embedded_session(policy: BusyPolicy) -> Session {
        let descriptor = ConnectionDescriptor::embedded_empty();
        let conn = sqlduet_drivers::connect(&descriptor).await.unwrap();
        Session::new(conn, &descriptor, policy)
    }

    #[tokio::test]
    async fn test_reject_policy_fails_fast_when_busy() {
        let session = embedded_session(BusyPolicy::Reject).await;
        let guard = session.acquire().await.unwrap();
        assert!(session.is_busy());

        let err = session.acquire().await.err().unwrap();
        assert!(matches!(err, DuetError::Busy));

        drop(guard);
        assert!(!session.is_busy());
        assert!(session.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_policy_waits_for_release() {
        let session = Arc::new(embedded_session(BusyPolicy::Queue).await);
        let guard = session.acquire().await.unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let guard = session.acquire().await?;
                guard.query("SELECT 1", &[]).await.map(|r| r.row_count())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let rows = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let session = embedded_session(BusyPolicy::Queue).await;
        session.close().await.unwrap();
        assert!(session.is_closed());
        assert!(matches!(
            session.acquire().await.err().unwrap(),
            DuetError::SessionClosed
        ));
    }

    #[tokio::test]
    async fn test_info_reports_dirty_state() {
        let session = embedded_session(BusyPolicy::Queue).await;
        let info = session.info();
        assert_eq!(info.dialect, Dialect::Embedded);
        assert_eq!(info.driver, "sqlite");
        assert_eq!(info.dirty, Some(false));

        session
            .acquire()
            .await
            .unwrap()
            .execute("CREATE TABLE t (x INTEGER)", &[])
            .await
            .unwrap();
        assert_eq!(session.info().dirty, Some(true));
    }
}
