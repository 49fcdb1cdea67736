//! sqlduet core - shared abstractions for the dual-backend data access layer
//!
//! This crate provides the traits and types every other sqlduet crate
//! depends on:
//!
//! - `DatabaseDriver` - opens connections for one backend
//! - `Connection` / `Transaction` - statement execution
//! - `SchemaIntrospection` - backend catalog queries, normalized into `TableDescriptor`
//! - `EmbeddedPersistence` - explicit save/export for the embedded backend
//! - `Dialect` - quoting, placeholders and statement classification
//! - `DuetError` - the error taxonomy shared by all layers

mod connection;
mod descriptor;
pub mod dialect;
mod driver;
mod error;
mod schema;
pub mod transaction;
mod types;

pub use connection::*;
pub use descriptor::*;
pub use dialect::{ColumnEquality, Dialect};
pub use driver::*;
pub use error::*;
pub use schema::*;
pub use transaction::*;
pub use types::*;
