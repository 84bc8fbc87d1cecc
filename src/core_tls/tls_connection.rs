// Connexions TLS sortantes pour rouilleftp
use crate::core_tls::error::TlsError;
use crate::core_tls::tls_config::TlsConfig;
use log::{debug, warn};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Client side TLS shared by the control and data connections of one session.
///
/// Data connections reuse the same `ClientConfig`, so rustls can resume the
/// control connection's session on them.
#[derive(Clone)]
pub struct TlsConnection {
    connector: TlsConnector,
}

impl TlsConnection {
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        config.validate()?;

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            warn!("Skipping system certificate: {}", error);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!("Loaded {} system root certificates ({} ignored)", added, ignored);

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| TlsError::CertificateLoadError(e.to_string()))?;
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                let cert = cert.map_err(|e| TlsError::CertificateLoadError(e.to_string()))?;
                roots
                    .add(cert)
                    .map_err(|e| TlsError::CertificateLoadError(e.to_string()))?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::TlsConfigError(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TlsError::InvalidServerName(format!("{}: {}", host, e)))?;

        match self.connector.connect(server_name, stream).await {
            Ok(tls_stream) => Ok(tls_stream),
            Err(e) => Err(TlsError::TlsHandshakeError(e.to_string())),
        }
    }
}
