//! Scheduler error types.

use bbque_res::AccountError;
use bbque_sync::SyncError;
use thiserror::Error;

/// Why a policy could not produce a schedule.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no resources available")]
    NoResources,

    #[error("policy failed: {0}")]
    Failed(String),
}

/// Errors that end a scheduling round.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("accounting error: {0}")]
    Account(#[from] AccountError),

    #[error("synchronization error: {0}")]
    Sync(#[from] SyncError),

    #[error("unknown policy: {0}")]
    UnknownPolicy(String),
}

pub type SchedResult<T> = Result<T, SchedError>;
