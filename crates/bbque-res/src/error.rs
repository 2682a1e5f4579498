//! Error types for the resource accounter.

use bbque_core::{PathError, ResourcePath, WorkloadId};
use thiserror::Error;

use crate::accounter::ViewToken;

/// Result type alias for accounter operations.
pub type AccountResult<T> = Result<T, AccountError>;

/// Errors that can occur while registering resources or booking them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("invalid resource path: {0}")]
    Path(#[from] PathError),

    #[error("bad resource path: {0}")]
    BadPath(String),

    #[error("resource {path} offline")]
    Offline { path: ResourcePath },

    #[error("not enough {path}: requested {requested}, available {available}")]
    NotEnough {
        path: ResourcePath,
        requested: u64,
        available: u64,
    },

    #[error("empty binding for workload {0}")]
    EmptyBinding(WorkloadId),

    #[error("too many open views (limit {0})")]
    TooManyViews(usize),

    #[error("unknown view {0}")]
    UnknownView(ViewToken),

    #[error("view {0} already adopted")]
    AlreadyAdopted(ViewToken),

    #[error("view {0} already closed")]
    AlreadyClosed(ViewToken),

    #[error("view {0} invalidated by a later adopt")]
    Invalidated(ViewToken),

    #[error("view {0} is the committed view")]
    CommittedView(ViewToken),
}
