// File d'opérations partagée par les workers
pub mod item;
pub mod queue;

pub use item::{ItemKind, ItemState, ItemUid, ProblemCode, QueueItem};
pub use queue::{InMemoryQueue, OperationQueue};
