use crate::core_error::FtpError;
use crate::core_network::DataConnectionError;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

pub type ItemUid = u64;

/// One node type of a delete/copy/move/change-attributes operation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    DeleteExploreDir,
    DeleteFile,
    DeleteLink,
    DeleteDir,
    CopyExploreDir,
    MoveExploreDir,
    CopyResolveLink,
    MoveResolveLink,
    CopyFile,
    MoveFile,
    /// Removes a moved directory once its content is gone.
    MoveDeleteDir,
    ChAttrsExploreDir,
    ChAttrsResolveLink,
    ChAttrsFile,
    ChAttrsDir,
    UploadCopyExploreDir,
    UploadMoveExploreDir,
    UploadCopyFile,
    UploadMoveFile,
    /// Removes the local directory of an upload-move once its content is gone.
    UploadMoveDeleteDir,
}

impl ItemKind {
    pub fn is_upload(self) -> bool {
        matches!(
            self,
            ItemKind::UploadCopyExploreDir
                | ItemKind::UploadMoveExploreDir
                | ItemKind::UploadCopyFile
                | ItemKind::UploadMoveFile
                | ItemKind::UploadMoveDeleteDir
        )
    }

    /// Items that never touch the server.
    pub fn is_local_only(self) -> bool {
        self == ItemKind::UploadMoveDeleteDir
    }

    pub fn is_download(self) -> bool {
        matches!(self, ItemKind::CopyFile | ItemKind::MoveFile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Waiting,
    Processing,
    /// Postponed, e.g. its target file is being written by another worker.
    Delayed,
    Done,
    Skipped,
    Failed,
    ForcedToFail,
}

impl ItemState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ItemState::Done | ItemState::Skipped | ItemState::Failed | ItemState::ForcedToFail
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemCode {
    ConnectionLost,
    ServerReply,
    LowMemory,
    CannotCreateTargetFile,
    TargetFileError,
    SourceFileError,
    DecompressError,
    SslError,
    NoDataTimeout,
    TargetExists,
    AsciiTransferForBinary,
    ChildItemFailed,
    Cancelled,
    Unexpected,
}

impl ProblemCode {
    pub fn from_error(error: &FtpError) -> ProblemCode {
        match error {
            FtpError::Server(_) | FtpError::UnexpectedReply(_) | FtpError::MalformedReply(_) => {
                ProblemCode::ServerReply
            }
            FtpError::Data(DataConnectionError::LowMemory) => ProblemCode::LowMemory,
            FtpError::Data(DataConnectionError::TargetFile(_)) => ProblemCode::TargetFileError,
            FtpError::Data(DataConnectionError::Decompression(_)) => ProblemCode::DecompressError,
            FtpError::Data(DataConnectionError::Ssl(_)) | FtpError::Tls(_) => ProblemCode::SslError,
            FtpError::Data(DataConnectionError::NoDataTimeout(_)) => ProblemCode::NoDataTimeout,
            FtpError::Data(DataConnectionError::Network(_)) => ProblemCode::ConnectionLost,
            FtpError::Disk(crate::core_disk::DiskError::LowMemory) => ProblemCode::LowMemory,
            FtpError::Disk(crate::core_disk::DiskError::CreateFailed { .. }) => {
                ProblemCode::CannotCreateTargetFile
            }
            FtpError::Disk(crate::core_disk::DiskError::ReadFailed { .. }) => ProblemCode::SourceFileError,
            FtpError::Disk(_) => ProblemCode::TargetFileError,
            FtpError::Cancelled | FtpError::ReconnectDeclined => ProblemCode::Cancelled,
            FtpError::DispatcherGone | FtpError::CalledFromDispatcher => ProblemCode::Unexpected,
            _ => ProblemCode::ConnectionLost,
        }
    }
}

impl fmt::Display for ProblemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProblemCode::ConnectionLost => "connection lost",
            ProblemCode::ServerReply => "server error",
            ProblemCode::LowMemory => "low memory",
            ProblemCode::CannotCreateTargetFile => "cannot create target file",
            ProblemCode::TargetFileError => "error writing target file",
            ProblemCode::SourceFileError => "error reading source file",
            ProblemCode::DecompressError => "cannot decompress data",
            ProblemCode::SslError => "SSL error",
            ProblemCode::NoDataTimeout => "no data transferred",
            ProblemCode::TargetExists => "target already exists",
            ProblemCode::AsciiTransferForBinary => "binary file in ASCII mode",
            ProblemCode::ChildItemFailed => "an item inside failed",
            ProblemCode::Cancelled => "cancelled",
            ProblemCode::Unexpected => "unexpected error",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub uid: ItemUid,
    /// Explore item this one was expanded from.
    pub parent: Option<ItemUid>,
    pub kind: ItemKind,
    /// Server directory containing `name`.
    pub path: String,
    pub name: String,
    /// Local directory: download target or upload source.
    pub local_dir: Option<PathBuf>,
    pub size: Option<u64>,
    /// New permission bits for change-attributes items.
    pub mode: Option<u32>,
    pub state: ItemState,
    pub problem: Option<ProblemCode>,
    /// Last server reply or local error text.
    pub error_text: Option<String>,
    /// Items that must finish first; any of them not done skips this one.
    pub depends_on: Vec<ItemUid>,
    pub delayed_until: Option<Instant>,
}

impl QueueItem {
    /// A waiting item; the queue assigns its uid when it is added.
    pub fn new(kind: ItemKind, path: &str, name: &str) -> Self {
        Self {
            uid: 0,
            parent: None,
            kind,
            path: path.to_string(),
            name: name.to_string(),
            local_dir: None,
            size: None,
            mode: None,
            state: ItemState::Waiting,
            problem: None,
            error_text: None,
            depends_on: Vec::new(),
            delayed_until: None,
        }
    }

    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = Some(dir.into());
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Local file of a download target or upload source.
    pub fn local_path(&self) -> Option<PathBuf> {
        self.local_dir.as_ref().map(|dir| dir.join(&self.name))
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} [{}]", self.kind, self.name, self.path)
    }
}
