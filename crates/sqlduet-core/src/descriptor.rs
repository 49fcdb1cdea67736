//! Connection descriptors for the two supported backends

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{ConnectionErrorKind, Dialect, DuetError, Result};

/// Transport security requested for a networked session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Whether a TLS handshake is attempted at all
    pub fn uses_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Whether the server certificate chain must validate
    pub fn verifies_certificate(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Whether the server hostname must match the certificate
    pub fn verifies_hostname(&self) -> bool {
        matches!(self, SslMode::VerifyFull)
    }
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = DuetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            other => Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                format!("unknown ssl mode '{}'", other),
            )),
        }
    }
}

/// Where an embedded session gets its initial contents from
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddedSource {
    /// Load an existing database file
    Path(PathBuf),
    /// Load a database image handed over by the caller
    Bytes(Vec<u8>),
    /// Start from an empty database
    Empty,
}

impl std::fmt::Debug for EmbeddedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddedSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            EmbeddedSource::Bytes(b) => write!(f, "Bytes(<{} bytes>)", b.len()),
            EmbeddedSource::Empty => f.write_str("Empty"),
        }
    }
}

/// Parameters for a client-server session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// PEM bundle of additional trusted roots
    #[serde(default)]
    pub ssl_root_cert: Option<PathBuf>,
}

impl NetworkDescriptor {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: None,
            password: None,
            ssl_mode: SslMode::default(),
            ssl_root_cert: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    pub fn with_ssl_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_root_cert = Some(path.into());
        self
    }

    /// Reject descriptors that can never connect
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                "host must not be empty",
            ));
        }
        if self.port == 0 {
            return Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                "port must be between 1 and 65535",
            ));
        }
        if self.database.trim().is_empty() {
            return Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                "database must not be empty",
            ));
        }
        if self.ssl_root_cert.is_some() && !self.ssl_mode.uses_tls() {
            return Err(DuetError::connection(
                ConnectionErrorKind::Malformed,
                "a root certificate was supplied but ssl mode is 'disable'",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NetworkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("ssl_mode", &self.ssl_mode)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .finish()
    }
}

/// Everything needed to open a session against one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionDescriptor {
    Embedded { source: EmbeddedSource },
    Network(NetworkDescriptor),
}

impl ConnectionDescriptor {
    pub fn embedded_file(path: impl Into<PathBuf>) -> Self {
        Self::Embedded {
            source: EmbeddedSource::Path(path.into()),
        }
    }

    pub fn embedded_bytes(bytes: Vec<u8>) -> Self {
        Self::Embedded {
            source: EmbeddedSource::Bytes(bytes),
        }
    }

    pub fn embedded_empty() -> Self {
        Self::Embedded {
            source: EmbeddedSource::Empty,
        }
    }

    pub fn network(descriptor: NetworkDescriptor) -> Self {
        Self::Network(descriptor)
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Embedded { .. } => Dialect::Embedded,
            Self::Network(_) => Dialect::Networked,
        }
    }

    /// Human-readable identity without credentials, safe to log
    pub fn display_identity(&self) -> String {
        match self {
            Self::Embedded { source } => match source {
                EmbeddedSource::Path(p) => p.display().to_string(),
                EmbeddedSource::Bytes(b) => format!("<in-memory image, {} bytes>", b.len()),
                EmbeddedSource::Empty => "<new database>".to_string(),
            },
            Self::Network(n) => format!("{}:{}/{}", n.host, n.port, n.database),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!("verify-full".parse::<SslMode>().ok(), Some(SslMode::VerifyFull));
        assert_eq!("VERIFY_CA".parse::<SslMode>().ok(), Some(SslMode::VerifyCa));
        assert_eq!(" disable ".parse::<SslMode>().ok(), Some(SslMode::Disable));

        let err = "sometimes".parse::<SslMode>().unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Malformed));
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let desc = NetworkDescriptor::new("  ", 5432, "app");
        let err = desc.validate().unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Malformed));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let desc = NetworkDescriptor::new("localhost", 0, "app");
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let desc = NetworkDescriptor::new("db", 5432, "app")
            .with_user("admin")
            .with_password("hunter2");
        let debug = format!("{:?}", desc);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let desc = NetworkDescriptor::new("db", 5432, "app").with_password("hunter2");
        let json = serde_json::to_string(&desc).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_display_identity_has_no_credentials() {
        let desc = ConnectionDescriptor::network(
            NetworkDescriptor::new("db.internal", 5433, "shop").with_password("pw"),
        );
        assert_eq!(desc.display_identity(), "db.internal:5433/shop");
        assert_eq!(desc.dialect(), Dialect::Networked);
    }
}
