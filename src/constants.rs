// src/constants.rs

pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_FTPS_PORT: u16 = 990;
pub const ANONYMOUS_USER: &str = "anonymous";

// Control connection
pub const SERVER_REPLY_TIMEOUT_SECS: u64 = 30;
pub const CONNECT_RETRIES: u32 = 20;
pub const DELAY_BETWEEN_RETRIES_SECS: u64 = 20;
pub const ABORT_DRAIN_GRACE_MS: u64 = 500;
pub const TELNET_IP_SYNCH: &[u8] = b"\xFF\xF4\xFF\xF2";

// Keep-alive
pub const KEEP_ALIVE_SEND_EVERY_SECS: u64 = 60;
pub const KEEP_ALIVE_STOP_AFTER_MINS: u64 = 30;
pub const KEEP_ALIVE_READ_BUF_SIZE: usize = 8192;

// Data connection
pub const DATACON_BYTES_TO_READ: usize = 8192;
pub const DATACON_FLUSH_BUFFER_SIZE: usize = 65536;
pub const DATACON_UPLOAD_BUFFER_SIZE: usize = 65536;
pub const DATACON_FLUSH_TIMEOUT_MS: u64 = 1000;
pub const DATACON_NO_DATA_CHECK_MS: u64 = 10_000;
pub const NO_DATA_TRANSFER_TIMEOUT_SECS: u64 = 60;
pub const SPEED_SAMPLE_WINDOW_SECS: u64 = 5;

// Listing cache
pub const CACHE_MAX_SIZE: u64 = 2 * 1024 * 1024;
pub const CACHE_MIN_SIZE: u64 = 100 * 1024;

// Session logs
pub const SESSION_LOG_MAX_LINES: usize = 1000;
pub const SESSION_LOG_MAX_CLOSED: usize = 16;

pub const DEFAULT_ASCII_MASKS: &str = "*.txt;*.htm;*.html;*.css;*.csv;*.xml;*.ini;*.log";

// Worker
pub const OPEN_FILE_RETRY_DELAY_MS: u64 = 1000;
