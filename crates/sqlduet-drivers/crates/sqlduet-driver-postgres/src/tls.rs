//! PostgreSQL TLS support
//!
//! Maps an [`SslMode`] onto a native-tls connector. The relaxed modes follow
//! libpq: without a root certificate they encrypt but do not verify, and with
//! one they verify the chain but not the hostname.

use native_tls::{Certificate, TlsConnector as NativeTlsConnector, TlsConnectorBuilder};
use postgres_native_tls::MakeTlsConnector;
use sqlduet_core::{NetworkDescriptor, SslMode};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Error types for TLS operations
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// Failed to read the root certificate bundle
    #[error("Failed to load CA certificate from {path}: {source}")]
    CaCertLoadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid CA certificate format: {0}")]
    InvalidCaCert(String),

    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),

    /// `disable` never builds a connector
    #[error("TLS mode {mode} does not use a TLS connector")]
    UnsupportedMode { mode: SslMode },
}

/// Build the connector for a descriptor whose mode uses TLS
pub fn build_connector(descriptor: &NetworkDescriptor) -> Result<MakeTlsConnector, TlsError> {
    let mode = descriptor.ssl_mode;
    if !mode.uses_tls() {
        return Err(TlsError::UnsupportedMode { mode });
    }

    info!(mode = %mode, "building PostgreSQL TLS connector");

    let mut builder = NativeTlsConnector::builder();
    configure_verification(&mut builder, mode, descriptor.ssl_root_cert.is_some());

    if let Some(ca_cert_path) = &descriptor.ssl_root_cert {
        apply_ca_cert(&mut builder, ca_cert_path)?;
    }

    let connector = builder
        .build()
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;

    debug!("TLS connector built successfully");
    Ok(MakeTlsConnector::new(connector))
}

/// Which checks a mode performs, as (verify chain, verify hostname)
pub(crate) fn verification_for(mode: SslMode, has_root_cert: bool) -> (bool, bool) {
    match mode {
        SslMode::Disable => (false, false),
        SslMode::Allow | SslMode::Prefer | SslMode::Require => (has_root_cert, false),
        SslMode::VerifyCa => (true, false),
        SslMode::VerifyFull => (true, true),
    }
}

fn configure_verification(builder: &mut TlsConnectorBuilder, mode: SslMode, has_root_cert: bool) {
    let (verify_chain, verify_hostname) = verification_for(mode, has_root_cert);
    if !verify_chain {
        debug!("certificate verification disabled");
        builder.danger_accept_invalid_certs(true);
    }
    if !verify_hostname {
        builder.danger_accept_invalid_hostnames(true);
    }
}

/// Load a PEM root certificate into the builder
fn apply_ca_cert(builder: &mut TlsConnectorBuilder, path: &Path) -> Result<(), TlsError> {
    debug!(path = %path.display(), "loading CA certificate");

    let pem_data = fs::read(path).map_err(|e| TlsError::CaCertLoadFailed {
        path: path.display().to_string(),
        source: e,
    })?;

    let cert =
        Certificate::from_pem(&pem_data).map_err(|e| TlsError::InvalidCaCert(e.to_string()))?;
    builder.add_root_certificate(cert);
    Ok(())
}

/// The tokio-postgres negotiation mode for a descriptor mode.
///
/// tokio-postgres has no `allow`; it is treated as `prefer`, which tries TLS
/// first and falls back to plaintext.
pub(crate) fn negotiation_mode(mode: SslMode) -> tokio_postgres::config::SslMode {
    use tokio_postgres::config::SslMode as PgSslMode;
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow | SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => PgSslMode::Require,
    }
}
