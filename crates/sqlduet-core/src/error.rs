//! Error types for sqlduet

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionErrorKind {
    /// The file or server could not be reached
    Unreachable,
    /// The server refused the supplied credentials
    AuthRejected,
    /// The descriptor itself is invalid, or the file is not a database
    Malformed,
}

/// Why catalog introspection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CatalogErrorKind {
    IntrospectionFailed,
}

/// Why a row mutation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationErrorKind {
    /// The WHERE clause matched zero rows
    NoSuchRow,
    /// The WHERE clause matched more than one row
    AmbiguousMatch,
    /// The table has no single-column unique key usable for targeted deletion
    MissingPrimaryKey,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::AuthRejected => write!(f, "authentication rejected"),
            Self::Malformed => write!(f, "malformed"),
        }
    }
}

impl std::fmt::Display for CatalogErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IntrospectionFailed => write!(f, "introspection failed"),
        }
    }
}

impl std::fmt::Display for MutationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchRow => write!(f, "no such row"),
            Self::AmbiguousMatch => write!(f, "ambiguous match"),
            Self::MissingPrimaryKey => write!(f, "missing primary key"),
        }
    }
}

/// Core error type for sqlduet operations
#[derive(Error, Debug)]
pub enum DuetError {
    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionErrorKind,
        message: String,
    },

    #[error("Catalog error ({kind}): {message}")]
    Catalog {
        kind: CatalogErrorKind,
        message: String,
    },

    #[error("Parse error at byte {offset}: {message}")]
    Parse { message: String, offset: usize },

    #[error("Execution error: {message}")]
    Execution {
        message: String,
        /// Backend error code (SQLSTATE for the networked backend)
        code: Option<String>,
        /// Position of the failing statement inside a batch
        statement_index: Option<usize>,
    },

    #[error("Mutation error ({kind}): {message}")]
    Mutation {
        kind: MutationErrorKind,
        message: String,
    },

    #[error("Nothing to save: the session has no unsaved changes")]
    NothingToSave,

    #[error("Session is busy with another operation")]
    Busy,

    #[error("A session is already open; close it before opening another")]
    SessionAlreadyOpen,

    #[error("No active session")]
    NoActiveSession,

    #[error("Session has been closed")]
    SessionClosed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DuetError {
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            message: message.into(),
        }
    }

    pub fn introspection(message: impl Into<String>) -> Self {
        Self::Catalog {
            kind: CatalogErrorKind::IntrospectionFailed,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>, offset: usize) -> Self {
        Self::Parse {
            message: message.into(),
            offset,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            code: None,
            statement_index: None,
        }
    }

    pub fn execution_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            code: Some(code.into()),
            statement_index: None,
        }
    }

    pub fn mutation(kind: MutationErrorKind, message: impl Into<String>) -> Self {
        Self::Mutation {
            kind,
            message: message.into(),
        }
    }

    /// Attach the batch position to an execution error. Other variants are returned unchanged.
    pub fn at_statement(self, index: usize) -> Self {
        match self {
            Self::Execution { message, code, .. } => Self::Execution {
                message,
                code,
                statement_index: Some(index),
            },
            other => other,
        }
    }

    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Self::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn mutation_kind(&self) -> Option<MutationErrorKind> {
        match self {
            Self::Mutation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Backend error code, if the backend supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Execution { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for sqlduet operations
pub type Result<T> = std::result::Result<T, DuetError>;
