//! Service layer error types

use sqlduet_core::{DuetError, MutationErrorKind};
use thiserror::Error;

/// Errors that can occur in the service layer
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Error raised by a session, driver, catalog or batch
    #[error(transparent)]
    Core(#[from] DuetError),

    /// A caller-supplied value cannot be used for the target column
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl ServiceError {
    /// The underlying core error, if this is one
    pub fn as_core(&self) -> Option<&DuetError> {
        match self {
            Self::Core(e) => Some(e),
            _ => None,
        }
    }

    pub fn mutation_kind(&self) -> Option<MutationErrorKind> {
        self.as_core().and_then(DuetError::mutation_kind)
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
