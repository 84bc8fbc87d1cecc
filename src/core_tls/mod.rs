// Support SSL/TLS côté client pour rouilleftp

pub mod error;
pub mod tls_config;
pub mod tls_connection;

pub use error::TlsError;
pub use tls_config::{TlsConfig, TlsMode};
pub use tls_connection::TlsConnection;
