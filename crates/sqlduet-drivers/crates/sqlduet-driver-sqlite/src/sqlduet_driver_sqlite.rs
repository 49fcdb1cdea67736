//! SQLite backend: an in-memory working copy of a database file

mod connection;
mod driver;
mod schema;

pub use connection::{SqliteCancelHandle, SqliteConnection, SqliteTransaction};
pub use driver::SqliteDriver;
