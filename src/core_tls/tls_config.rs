// Configuration TLS pour rouilleftp
use crate::core_tls::error::TlsError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain FTP.
    None,
    /// AUTH TLS on the regular port.
    Explicit,
    /// TLS from the first byte (FTPS, usually port 990).
    Implicit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub mode: TlsMode,

    /// Encrypt data connections too (PBSZ 0 + PROT P).
    pub encrypt_data: bool,

    /// Extra trusted root, PEM encoded, on top of the system store.
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::None,
            encrypt_data: true,
            ca_file: None,
        }
    }
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.mode != TlsMode::None
    }

    /// Vérifie si la configuration TLS est valide
    pub fn validate(&self) -> Result<(), TlsError> {
        if let Some(ca_file) = &self.ca_file {
            if !ca_file.exists() {
                return Err(TlsError::CertificateLoadError(format!(
                    "CA file not found: {:?}",
                    ca_file
                )));
            }
        }
        Ok(())
    }
}
