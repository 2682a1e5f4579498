//! Workload registry and state machine error types.

use bbque_core::WorkloadId;
use thiserror::Error;

use crate::state::{State, SyncState};

/// Errors that can occur while managing workloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppError {
    #[error("workload not found: {0}")]
    NotFound(WorkloadId),

    #[error("workload already registered: {0}")]
    Duplicate(WorkloadId),

    #[error("sync-state {sync} not expected with state {state}")]
    SyncNotExpected { state: State, sync: SyncState },

    #[error("workload {id}: transition {from} -> {to} not allowed")]
    WrongState {
        id: WorkloadId,
        from: State,
        to: State,
    },

    #[error("recipe {recipe}: duplicate working mode id {id}")]
    DuplicateMode { recipe: String, id: u8 },

    #[error("process not managed: {0}")]
    NotManaged(String),
}

pub type AppResult<T> = Result<T, AppError>;
