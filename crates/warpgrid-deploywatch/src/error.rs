//! Deployment watcher error types.

use thiserror::Error;

/// Errors surfaced by the deployment watcher and its collaborators.
///
/// `Clone` so a single batch commit result can be handed to every caller
/// sharing that batch's future.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// The epoch's cancellation scope was terminated.
    #[error("operation cancelled")]
    Cancelled,

    #[error("deployment {deployment_id:?} references unknown job {job_id:?}")]
    JobNotFound {
        deployment_id: String,
        job_id: String,
    },

    #[error("deployment {0:?} not being watched for updates")]
    NotWatched(String),

    #[error("consensus write failed: {0}")]
    Consensus(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type WatchResult<T> = Result<T, WatchError>;
