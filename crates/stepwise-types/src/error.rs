use thiserror::Error;
use uuid::Uuid;

/// Errors from repository operations (used by trait definitions in stepwise-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A fenced write found the run's lease moved past the writer's version.
    #[error("lease {lease_version} on run {run_id} is no longer held")]
    LeaseLost { run_id: Uuid, lease_version: u64 },
}
