// Connexions réseau du client : contrôle, données, proxy
pub mod control;
pub mod data;
pub mod keepalive;
pub mod proxy;
pub mod transport;

pub use control::{CommandOptions, ConnectParams, ControlConnection};
pub use data::{DataConnection, DataConnectionError, DataSink, DataSource, TransferState, TransferStats};
pub use keepalive::{KeepAliveCommand, KeepAliveConfig, KeepAliveMode};
pub use proxy::{ProxyConfig, ProxyError, ProxyKind};
pub use transport::Transport;
