//! sqlduet connection - session lifecycle
//!
//! A [`Session`] wraps one backend connection and serializes every operation
//! issued against it. The [`SessionManager`] keeps at most one session live.

mod manager;
mod session;

pub use manager::SessionManager;
pub use session::{BusyPolicy, Session, SessionGuard, SessionInfo};
