use crate::core_disk::OpenFileGuard;
use crate::core_ftpcommand::TransferType;
use crate::core_queue::{ItemUid, ProblemCode, QueueItem};

/// An item taken from the queue, with what preparing it decided.
#[derive(Debug)]
pub struct Job {
    pub item: QueueItem,
    /// `REST` offset for a resumed download.
    pub resume_from: Option<u64>,
    pub transfer: TransferType,
    /// Held while the item writes its local target.
    pub claim: Option<OpenFileGuard>,
}

impl Job {
    pub fn new(item: QueueItem) -> Self {
        Self {
            item,
            resume_from: None,
            transfer: TransferType::Binary,
            claim: None,
        }
    }
}

/// Worker state. Each variant carries exactly the data valid in it.
#[derive(Debug)]
pub enum WorkerState {
    LookingForWork,
    /// Nothing eligible in the queue.
    Sleeping,
    Preparing(QueueItem),
    /// `attempts` counts the attempts already used for this item.
    Connecting { job: Job, attempts: u32 },
    WaitingForReconnect { job: Job, attempts: u32, error: String },
    Working { job: Job, attempts: u32 },
    /// Gave up connecting; the item went back to the queue.
    ConnectionError { error: String },
    Stopped,
}

impl WorkerState {
    pub fn status(&self) -> WorkerStatus {
        match self {
            WorkerState::LookingForWork => WorkerStatus::LookingForWork,
            WorkerState::Sleeping => WorkerStatus::Sleeping,
            WorkerState::Preparing(item) => WorkerStatus::Preparing { item: item.uid },
            WorkerState::Connecting { job, attempts } => WorkerStatus::Connecting {
                item: job.item.uid,
                attempt: attempts + 1,
            },
            WorkerState::WaitingForReconnect { job, attempts, error } => {
                WorkerStatus::WaitingForReconnect {
                    item: job.item.uid,
                    attempt: *attempts,
                    error: error.clone(),
                }
            }
            WorkerState::Working { job, .. } => WorkerStatus::Working { item: job.item.uid },
            WorkerState::ConnectionError { error } => WorkerStatus::ConnectionError {
                error: error.clone(),
            },
            WorkerState::Stopped => WorkerStatus::Stopped,
        }
    }
}

/// Snapshot of a worker state published to its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    LookingForWork,
    Sleeping,
    Preparing { item: ItemUid },
    Connecting { item: ItemUid, attempt: u32 },
    WaitingForReconnect { item: ItemUid, attempt: u32, error: String },
    Working { item: ItemUid },
    ConnectionError { error: String },
    Stopped,
}

impl WorkerStatus {
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Sleeping | WorkerStatus::ConnectionError { .. } | WorkerStatus::Stopped
        )
    }
}

/// How a finished item is reported to the queue.
#[derive(Debug)]
pub enum Outcome {
    Done,
    Skipped { problem: ProblemCode, detail: String },
    Failed { problem: ProblemCode, detail: String },
    /// An explored directory or a resolved link, replaced by these items.
    Replaced(Vec<QueueItem>),
}
