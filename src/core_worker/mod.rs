// Exécution des éléments de la file d'opérations

pub mod classifier;
pub mod flows;
pub mod state;
pub mod worker;

pub use classifier::TransferModeClassifier;
pub use state::{Job, Outcome, WorkerState, WorkerStatus};
pub use worker::{Worker, WorkerContext, WorkerHandle};
