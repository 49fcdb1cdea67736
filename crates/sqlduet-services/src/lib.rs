//! sqlduet Services Layer
//!
//! This crate provides the service layer that sits between the UI and the
//! data access crates. The UI talks only to [`Workspace`]; it never issues raw
//! backend calls.
//!
//! # Architecture
//!
//! ```text
//! UI Layer
//!     ↓
//! Service Layer (sqlduet-services) ← This crate
//!     ↓
//! Domain Layer (sqlduet-query, sqlduet-schema, sqlduet-connection)
//!     ↓
//! Infrastructure Layer (sqlduet-core, sqlduet-drivers)
//! ```
//!
//! # Services
//!
//! - [`Workspace`] - Session lifecycle, schema, batches, row edits and saving
//! - [`RowMutationService`] - Row edits and deletions reconciled against the row as read
//! - [`DuetSettings`] - Persisted settings
//! - [`logging`] - Subscriber initialisation

mod error;
pub mod logging;
mod mutation;
mod settings;
mod workspace;

pub use error::{ServiceError, ServiceResult};
pub use logging::LoggingConfig;
pub use mutation::{MatchStrategy, MutationStatement, RowMutationService, coerce_identifier};
pub use settings::{
    BatchSettings, CatalogSettings, ContextSettings, DuetSettings, MutationSettings,
    SessionSettings,
};
pub use workspace::Workspace;

// Re-export what callers need to drive a workspace
pub use sqlduet_connection::{BusyPolicy, SessionInfo};
pub use sqlduet_core::{
    ConnectionDescriptor, Dialect, DuetError, MutationErrorKind, NetworkDescriptor, RowSnapshot,
    SslMode, TableDescriptor, Value,
};
pub use sqlduet_query::{BatchResult, BatchState, CancellationToken, StatementResult};
pub use sqlduet_schema::{CatalogSnapshot, ForeignKeyGraph};
