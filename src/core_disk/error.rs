// Erreurs disque
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DiskError {
    #[error("Not enough memory for transfer buffers")]
    LowMemory,

    #[error("Unable to create {path}: {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    #[error("Unable to write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Unable to read {path}: {reason}")]
    ReadFailed { path: PathBuf, reason: String },

    #[error("Disk writer for {0} has stopped")]
    WriterGone(PathBuf),
}
