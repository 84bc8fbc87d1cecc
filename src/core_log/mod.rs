pub mod logger;
pub mod session_logs;

pub use logger::init_logger;
pub use session_logs::{LogUid, SessionLogs};
