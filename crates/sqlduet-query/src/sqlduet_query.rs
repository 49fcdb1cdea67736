//! sqlduet query - statement splitting and batch execution
//!
//! A script is split into statements with the rules of the session's dialect,
//! then run by [`BatchExecutor`] either atomically (one transaction, abort on the
//! first failure) or statement by statement (each commits on its own).

pub mod batch;
mod splitter;

pub use batch::{
    BatchExecutor, BatchOptions, BatchResult, BatchState, BatchWarning, StatementError,
    StatementResult, StatementStatus,
};
pub use splitter::split_statements;

/// Re-exported so callers can cancel a batch without depending on tokio-util directly
pub use tokio_util::sync::CancellationToken;
