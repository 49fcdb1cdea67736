//! Batch query execution module
//!
//! A script runs on one session with exclusive use of it for the whole batch,
//! either atomically or with per-statement commits.

mod executor;

pub use executor::{
    BatchExecutor, BatchOptions, BatchResult, BatchState, BatchWarning, StatementError,
    StatementResult, StatementStatus,
};
