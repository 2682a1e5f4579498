//! Workload states, sync-states, and next-sync classification.

use std::fmt;

use serde::{Deserialize, Serialize};

use bbque_res::is_reshuffling;

use crate::working_mode::Assignment;

/// Scheduling state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    New,
    Ready,
    Sync,
    Running,
    Frozen,
    Thawed,
    Restoring,
    Finished,
}

impl State {
    pub const ALL: [State; 8] = [
        State::New,
        State::Ready,
        State::Sync,
        State::Running,
        State::Frozen,
        State::Thawed,
        State::Restoring,
        State::Finished,
    ];

    /// Waiting for, or holding, resources from the scheduler.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            State::Ready | State::Running | State::Thawed | State::Restoring
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, State::Ready | State::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Ready => "READY",
            State::Sync => "SYNC",
            State::Running => "RUNNING",
            State::Frozen => "FROZEN",
            State::Thawed => "THAWED",
            State::Restoring => "RESTORING",
            State::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of synchronization a workload in `SYNC` is going through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Starting,
    Reconf,
    MigRec,
    Migrate,
    Blocked,
    Disabled,
    SyncNone,
}

impl SyncState {
    pub const ALL: [SyncState; 7] = [
        SyncState::Starting,
        SyncState::Reconf,
        SyncState::MigRec,
        SyncState::Migrate,
        SyncState::Blocked,
        SyncState::Disabled,
        SyncState::SyncNone,
    ];

    /// Sync-states that end with the workload holding an assignment.
    pub fn acquires_resources(&self) -> bool {
        matches!(
            self,
            SyncState::Starting | SyncState::Reconf | SyncState::MigRec | SyncState::Migrate
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Starting => "STARTING",
            SyncState::Reconf => "RECONFIG",
            SyncState::MigRec => "R-MIGRATED",
            SyncState::Migrate => "MIGRATED",
            SyncState::Blocked => "BLOCKED",
            SyncState::Disabled => "DISABLED",
            SyncState::SyncNone => "SYNC_NONE",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the synchronization needed to move from `current` to `next`.
///
/// `state` is the state the workload is in before entering `SYNC`.
/// `SyncNone` means there is nothing to synchronize.
pub fn classify_next_sync(
    current: Option<&Assignment>,
    next: &Assignment,
    state: State,
) -> SyncState {
    let Some(current) = current else {
        return SyncState::Starting;
    };

    let mode_changed = current.mode.id != next.mode.id;
    let cpu_changed = current.binding.cpu_set() != next.binding.cpu_set();

    if mode_changed && cpu_changed {
        SyncState::MigRec
    } else if cpu_changed {
        SyncState::Migrate
    } else if mode_changed {
        SyncState::Reconf
    } else if is_reshuffling(&current.binding, &next.binding) {
        SyncState::Reconf
    } else if state == State::Thawed {
        SyncState::Starting
    } else {
        SyncState::SyncNone
    }
}
