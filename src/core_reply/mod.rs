pub mod parser;
pub mod reply;

pub use parser::{format_port_argument, parse_data_size, parse_pasv_reply, parse_pwd_reply, take_reply};
pub use reply::{FtpReply, ReplyClass, ReplyFunction};
