use thiserror::Error;

use crate::scheduler::SlotId;

#[derive(Error, Debug)]
pub enum FarmError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Worker pool at capacity ({max} workers)")]
    PoolAtCapacity { max: usize },

    #[error("Worker not found: {0}")]
    WorkerNotFound(SlotId),

    #[error("Worker {0} is no longer reachable")]
    WorkerUnreachable(SlotId),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Supervisor is not running")]
    SupervisorClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FarmError>;
