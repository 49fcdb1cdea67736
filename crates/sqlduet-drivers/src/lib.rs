//! sqlduet drivers - the two supported backends behind one entry point
//!
//! Each backend lives in its own crate and is enabled by a cargo feature of
//! the same name. [`connect`] picks the backend from the descriptor.

#[cfg(feature = "postgres")]
pub use sqlduet_driver_postgres as postgres;
#[cfg(feature = "sqlite")]
pub use sqlduet_driver_sqlite as sqlite;

mod registry;

pub use registry::{DriverRegistry, connect};

/// Re-export commonly used types from sqlduet-core
pub use sqlduet_core::{
    Connection, ConnectionDescriptor, DatabaseDriver, Dialect, DriverCapabilities, DuetError,
    QueryResult, Result, Row, SchemaIntrospection, Transaction, Value,
};
