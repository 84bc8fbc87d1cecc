use crate::constants::{
    CACHE_MAX_SIZE, CONNECT_RETRIES, DEFAULT_ASCII_MASKS, DELAY_BETWEEN_RETRIES_SECS,
    NO_DATA_TRANSFER_TIMEOUT_SECS, SERVER_REPLY_TIMEOUT_SECS,
};
use crate::core_network::{KeepAliveConfig, ProxyConfig, ProxyKind};
use crate::core_tls::TlsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(String, String),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub server_reply_timeout_secs: u64,
    pub no_data_transfer_timeout_secs: u64,
    /// Reconnect attempts per item; the attempt budget is one more.
    pub connect_retries: u32,
    pub delay_between_retries_secs: u64,
    pub passive_mode: bool,
    pub list_command: String,
    /// `;` separated commands sent after login.
    pub init_commands: String,
    pub max_workers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_reply_timeout_secs: SERVER_REPLY_TIMEOUT_SECS,
            no_data_transfer_timeout_secs: NO_DATA_TRANSFER_TIMEOUT_SECS,
            connect_retries: CONNECT_RETRIES,
            delay_between_retries_secs: DELAY_BETWEEN_RETRIES_SECS,
            passive_mode: true,
            list_command: String::from("LIST"),
            init_commands: String::new(),
            max_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: CACHE_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferModeSetting {
    /// ASCII for names matching `ascii_masks`, binary otherwise.
    Auto,
    Ascii,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingTarget {
    Overwrite,
    Resume,
    Skip,
}

/// What to do when an ASCII mode download turns out to be binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AsciiForBinary {
    Ignore,
    Binary,
    Fail,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransferConfig {
    pub ascii_masks: String,
    pub transfer_mode: TransferModeSetting,
    /// Ask for `MODE Z` after login.
    pub compress: bool,
    pub existing_target: ExistingTarget,
    pub ascii_for_binary: AsciiForBinary,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ascii_masks: String::from(DEFAULT_ASCII_MASKS),
            transfer_mode: TransferModeSetting::Auto,
            compress: false,
            existing_target: ExistingTarget::Overwrite,
            ascii_for_binary: AsciiForBinary::Ignore,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub keep_alive: KeepAliveConfig,
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub tls: TlsConfig,
    pub proxy: ProxyConfig,
}

impl ClientConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e.to_string()))?;
        let config: ClientConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.server_reply_timeout_secs == 0 {
            return Err(ConfigError::Invalid("server_reply_timeout_secs must be positive".into()));
        }
        if self.connection.no_data_transfer_timeout_secs == 0 {
            return Err(ConfigError::Invalid("no_data_transfer_timeout_secs must be positive".into()));
        }
        if self.connection.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.connection.list_command.trim().is_empty() {
            return Err(ConfigError::Invalid("list_command is empty".into()));
        }
        if self.proxy.kind != ProxyKind::None && self.proxy.host.is_empty() {
            return Err(ConfigError::Invalid("proxy host is missing".into()));
        }
        self.tls
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}
