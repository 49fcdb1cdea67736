//! PostgreSQL backend over tokio-postgres

mod connection;
mod driver;
mod schema;
mod tls;
mod value;

pub use connection::{PostgresCancelHandle, PostgresConnection, PostgresTransaction};
pub use driver::PostgresDriver;
pub use tls::{TlsError, build_connector};
