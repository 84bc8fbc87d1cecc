// Gestion des erreurs du moteur de session FTP
use crate::core_disk::DiskError;
use crate::core_network::data::DataConnectionError;
use crate::core_network::proxy::ProxyError;
use crate::core_reply::{FtpReply, ReplyClass};
use crate::core_tls::TlsError;
use thiserror::Error;

/// Which part of the taxonomy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Refused, reset, timed out.
    Network,
    /// Malformed or unexpected reply, server-side errors.
    Protocol,
    /// Memory, local files, decompression.
    Resource,
    /// The user (or the host) cancelled or declined.
    Policy,
}

#[derive(Error, Debug)]
pub enum FtpError {
    #[error("Unable to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("No reply from server within {0} seconds")]
    ReplyTimeout(u64),

    #[error("Malformed server reply: {0}")]
    MalformedReply(String),

    #[error("Unexpected server reply: {0}")]
    UnexpectedReply(FtpReply),

    #[error("Server error: {0}")]
    Server(FtpReply),

    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Data(#[from] DataConnectionError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Reconnect declined")]
    ReconnectDeclined,

    #[error("Dispatcher is not running")]
    DispatcherGone,

    #[error("Blocking call issued from the dispatcher thread")]
    CalledFromDispatcher,
}

impl FtpError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            FtpError::ConnectFailed { .. }
            | FtpError::ConnectionLost(_)
            | FtpError::ReplyTimeout(_)
            | FtpError::NotConnected
            | FtpError::Io(_)
            | FtpError::Proxy(_)
            | FtpError::Tls(_) => ErrorCategory::Network,
            FtpError::MalformedReply(_) | FtpError::UnexpectedReply(_) | FtpError::Server(_) => {
                ErrorCategory::Protocol
            }
            FtpError::Data(e) => e.category(),
            FtpError::Disk(_) => ErrorCategory::Resource,
            FtpError::Cancelled
            | FtpError::ReconnectDeclined
            | FtpError::DispatcherGone
            | FtpError::CalledFromDispatcher => ErrorCategory::Policy,
        }
    }

    /// Whether reconnecting and trying the same item again can help.
    pub fn is_transient(&self) -> bool {
        match self {
            FtpError::Server(reply) | FtpError::UnexpectedReply(reply) => {
                reply.class() == ReplyClass::TransientError
            }
            FtpError::MalformedReply(_) => true,
            FtpError::Tls(_) => false,
            FtpError::Data(e) => e.is_transient(),
            other => other.category() == ErrorCategory::Network,
        }
    }

    /// Whether the control connection is unusable after this error.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            FtpError::ConnectionLost(_)
                | FtpError::ReplyTimeout(_)
                | FtpError::MalformedReply(_)
                | FtpError::NotConnected
                | FtpError::Io(_)
                | FtpError::Tls(_)
        )
    }

    /// The server reply attached to this error, if any.
    pub fn reply(&self) -> Option<&FtpReply> {
        match self {
            FtpError::Server(reply) | FtpError::UnexpectedReply(reply) => Some(reply),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(code: u16) -> FtpError {
        FtpError::Server(FtpReply::new(code, vec![format!("{} text", code)]).unwrap())
    }

    #[test]
    fn test_transient_classification() {
        assert!(server(421).is_transient());
        assert!(!server(550).is_transient());
        assert!(FtpError::ReplyTimeout(30).is_transient());
        assert!(FtpError::ConnectionLost("reset".into()).is_transient());
        assert!(!FtpError::Cancelled.is_transient());
        assert!(!FtpError::Disk(DiskError::LowMemory).is_transient());
    }

    #[test]
    fn test_categories() {
        assert_eq!(server(550).category(), ErrorCategory::Protocol);
        assert_eq!(FtpError::ReconnectDeclined.category(), ErrorCategory::Policy);
        assert_eq!(FtpError::Disk(DiskError::LowMemory).category(), ErrorCategory::Resource);
        assert_eq!(FtpError::NotConnected.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_reply_attached() {
        let err = server(550);
        assert_eq!(err.reply().map(|r| r.code), Some(550));
        assert!(!err.is_connection_fatal());
    }
}
