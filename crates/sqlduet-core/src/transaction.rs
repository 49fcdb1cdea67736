//! Transaction extensions beyond the base `Transaction` trait

mod savepoint;

pub use savepoint::*;
