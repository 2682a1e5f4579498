//! Synchronization error types.

use bbque_app::AppError;
use bbque_core::WorkloadId;
use bbque_res::AccountError;
use thiserror::Error;

/// Errors reported by a platform proxy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The resources of one workload could not be mapped.
    #[error("mapping failed for {id}: {reason}")]
    MappingFailed { id: WorkloadId, reason: String },

    #[error("platform init failed: {0}")]
    InitFailed(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The platform layer is unusable; the whole round must be rolled back.
    #[error("platform crashed: {0}")]
    Crashed(String),
}

/// Errors reported by the workload RPC channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("workload {0} unreachable")]
    Unreachable(WorkloadId),

    #[error("workload {id}: {reason}")]
    Failed { id: WorkloadId, reason: String },
}

/// Errors that abort a synchronization round.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("accounting error: {0}")]
    Account(#[from] AccountError),

    #[error("workload error: {0}")]
    App(#[from] AppError),
}

pub type SyncResult<T> = Result<T, SyncError>;
