// Commandes FTP émises par le client
pub mod ftpcommand;

pub use ftpcommand::{split_init_commands, FtpCommand, TransferType};
