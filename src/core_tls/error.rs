// Gestion des erreurs pour le module TLS
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to load CA certificate: {0}")]
    CertificateLoadError(String),

    #[error("Invalid server name for TLS: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeError(String),

    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    #[error("Server refused TLS: {0}")]
    TlsRefused(String),

    #[error("TLS not configured")]
    TlsNotConfigured,
}
