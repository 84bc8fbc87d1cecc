// Moteur de session d'un client FTP

pub mod config;
pub mod constants;
pub mod core_cache;
pub mod core_disk;
pub mod core_dispatch;
pub mod core_error;
pub mod core_ftpcommand;
pub mod core_listing;
pub mod core_log;
pub mod core_network;
pub mod core_path;
pub mod core_queue;
pub mod core_reply;
pub mod core_tls;
pub mod core_worker;

pub use config::ClientConfig;
pub use core_error::FtpError;
