//! Synchronization protocol messages towards managed applications.
//!
//! Every message carries the round token, so an application can tell a
//! late reply of an earlier round from a fresh one.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bbque_app::{Assignment, SyncState};
use bbque_core::{ResourceType, WorkloadId};

use crate::error::RpcError;

/// What a workload is told about its next assignment in PreChange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub sync_state: SyncState,
    pub mode_id: Option<u8>,
    pub mode_name: Option<String>,
    /// Processing elements of the next assignment, by id.
    pub cpu_ids: Vec<u32>,
}

impl ChangeSummary {
    pub fn new(sync_state: SyncState, next: Option<&Assignment>) -> Self {
        Self {
            sync_state,
            mode_id: next.map(|a| a.mode.id),
            mode_name: next.map(|a| a.mode.name.clone()),
            cpu_ids: next
                .map(|a| a.binding.ids_of(ResourceType::ProcElement).into_iter().collect())
                .unwrap_or_default(),
        }
    }
}

/// Reply to SyncChange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncReply {
    Ok,
    /// The workload cannot reach a sync point; abandon its change.
    Refused,
}

/// Reply to PostChange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostReply {
    Ok,
    Abort,
    /// Keep running with the assignment held before this round.
    Continue,
}

/// Channel to the run-time library of adaptive applications.
#[async_trait]
pub trait WorkloadRpc: Send + Sync {
    /// Announce the change. Returns the latency the workload needs to
    /// reach its next sync point.
    async fn pre_change(
        &self,
        round: u64,
        id: WorkloadId,
        change: ChangeSummary,
    ) -> Result<Duration, RpcError>;

    async fn sync_change(&self, round: u64, id: WorkloadId) -> Result<SyncReply, RpcError>;

    /// Tell the workload to switch. Fire and forget.
    async fn do_change(&self, round: u64, id: WorkloadId);

    async fn post_change(&self, round: u64, id: WorkloadId) -> Result<PostReply, RpcError>;
}
