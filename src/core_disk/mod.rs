// Écritures disque des transferts

pub mod disk_io;
pub mod error;
pub mod open_files;

pub use disk_io::DiskFlusher;
pub use error::DiskError;
pub use open_files::{OpenFileGuard, OpenFiles};
