//! Session manager: at most one live session per instance

use parking_lot::RwLock;
use sqlduet_core::{ConnectionDescriptor, DuetError, Result};
use sqlduet_drivers::DriverRegistry;
use std::sync::Arc;

use crate::{BusyPolicy, Session};

/// Owns the single live [`Session`].
///
/// Opening while a session is live fails with `SessionAlreadyOpen`; the caller
/// decides whether to save and close first. Nothing is replaced silently.
pub struct SessionManager {
    /// Driver registry
    drivers: DriverRegistry,

    current: RwLock<Option<Arc<Session>>>,

    /// Serializes open and close against each other
    lifecycle: tokio::sync::Mutex<()>,

    busy_policy: BusyPolicy,
}

impl SessionManager {
    /// Create a manager with the built-in drivers
    pub fn new() -> Self {
        Self::with_registry(DriverRegistry::with_defaults())
    }

    pub fn with_registry(drivers: DriverRegistry) -> Self {
        Self {
            drivers,
            current: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            busy_policy: BusyPolicy::default(),
        }
    }

    /// Policy applied to sessions opened from now on
    pub fn with_busy_policy(mut self, busy_policy: BusyPolicy) -> Self {
        self.busy_policy = busy_policy;
        self
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Open a session for `descriptor`
    #[tracing::instrument(skip(self, descriptor), fields(identity = %descriptor.display_identity()))]
    pub async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<Session>> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(live) = self.current() {
            tracing::warn!(live_session = %live.id(), "refusing to open a second session");
            return Err(DuetError::SessionAlreadyOpen);
        }

        tracing::info!("opening session");
        let conn = self.drivers.connect(descriptor).await.inspect_err(|e| {
            tracing::error!(error = %e, "failed to open session");
        })?;

        let session = Arc::new(Session::new(conn, descriptor, self.busy_policy));
        *self.current.write() = Some(Arc::clone(&session));

        tracing::info!(session_id = %session.id(), dialect = %session.dialect().name(), "session opened");
        Ok(session)
    }

    /// Close the live session.
    ///
    /// The session is retired even when the backend reports an error while
    /// closing; that error is still returned.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(session) = self.current.write().take() else {
            return Err(DuetError::NoActiveSession);
        };

        let result = session.close().await;
        match &result {
            Ok(()) => tracing::info!(session_id = %session.id(), "session closed"),
            Err(e) => tracing::warn!(session_id = %session.id(), error = %e, "session closed with error"),
        }
        result
    }

    /// The live session. A session whose connection has already gone away is not live.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// The live session, or `NoActiveSession`
    pub fn require(&self) -> Result<Arc<Session>> {
        self.current().ok_or(DuetError::NoActiveSession)
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlduet_core::ConnectionErrorKind;

    #[tokio::test]
    async fn test_single_live_session() {
        let manager = SessionManager::new();
        let first = manager
            .open(&ConnectionDescriptor::embedded_empty())
            .await
            .unwrap();

        let err = manager
            .open(&ConnectionDescriptor::embedded_empty())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DuetError::SessionAlreadyOpen));
        assert_eq!(manager.require().unwrap().id(), first.id());

        manager.close().await.unwrap();
        assert!(first.is_closed());
        assert!(!manager.is_open());

        let second = manager
            .open(&ConnectionDescriptor::embedded_empty())
            .await
            .unwrap();
        assert_ne!(second.id(), first.id());
    }

    #[tokio::test]
    async fn test_close_without_session() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.close().await.err().unwrap(),
            DuetError::NoActiveSession
        ));
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = SessionManager::new();
        let err = manager
            .open(&ConnectionDescriptor::embedded_file(dir.path().join("missing.db")))
            .await
            .err()
            .unwrap();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Unreachable));
        assert!(manager.current().is_none());
    }

    #[tokio::test]
    async fn test_busy_policy_applies_to_new_sessions() {
        let manager = SessionManager::new().with_busy_policy(BusyPolicy::Reject);
        let session = manager
            .open(&ConnectionDescriptor::embedded_empty())
            .await
            .unwrap();
        assert_eq!(session.busy_policy(), BusyPolicy::Reject);
    }
}
