//! Schedulable workloads and their state machine.
//!
//! Every workload carries a single mutex over its scheduling record.
//! `Workload::lock` pins the workload and returns a guard whose accessors
//! and mutators run without further locking; the plain accessors on
//! `Workload` take and release the lock per call.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use bbque_core::{Priority, WorkloadId};

use crate::error::{AppError, AppResult};
use crate::state::{State, SyncState, classify_next_sync};
use crate::working_mode::{Assignment, Recipe, ScheduleRequest, WorkingMode};

/// Registration path of a workload.
#[derive(Debug, Clone)]
pub enum WorkloadKind {
    /// Application linked against the RTLib, with a recipe of working modes.
    Adaptive(Arc<Recipe>),
    /// Unmodified OS process tracked by name.
    Process,
}

/// Scheduling record of one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub state: State,
    pub pre_sync_state: State,
    pub sync_state: SyncState,
    pub current: Option<Assignment>,
    pub next: Option<Assignment>,
    pub count: u64,
    pub block_requested: bool,
    pub request: ScheduleRequest,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            state: State::New,
            pre_sync_state: State::New,
            sync_state: SyncState::SyncNone,
            current: None,
            next: None,
            count: 0,
            block_requested: false,
            request: ScheduleRequest::default(),
        }
    }
}

/// A schedulable entity: an adaptive application or a tracked process.
#[derive(Debug)]
pub struct Workload {
    id: WorkloadId,
    name: String,
    kind: WorkloadKind,
    priority: Priority,
    schedule: Mutex<Schedule>,
    attributes: Mutex<BTreeMap<String, String>>,
}

impl Workload {
    pub fn new(id: WorkloadId, name: &str, kind: WorkloadKind, priority: Priority) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            priority,
            schedule: Mutex::new(Schedule::default()),
            attributes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> WorkloadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &WorkloadKind {
        &self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_process(&self) -> bool {
        matches!(self.kind, WorkloadKind::Process)
    }

    /// Pin the workload for a sequence of reads and transitions.
    pub fn lock(&self) -> WorkloadGuard<'_> {
        WorkloadGuard {
            id: self.id,
            schedule: self.schedule.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    pub fn sync_state(&self) -> SyncState {
        self.lock().sync_state()
    }

    pub fn pre_sync_state(&self) -> State {
        self.lock().pre_sync_state()
    }

    pub fn current(&self) -> Option<Assignment> {
        self.lock().current().cloned()
    }

    pub fn next(&self) -> Option<Assignment> {
        self.lock().next().cloned()
    }

    pub fn schedule_count(&self) -> u64 {
        self.lock().schedule_count()
    }

    /// Working modes the workload can be scheduled in.
    pub fn working_modes(&self) -> Vec<Arc<WorkingMode>> {
        match &self.kind {
            WorkloadKind::Adaptive(recipe) => recipe.modes().to_vec(),
            WorkloadKind::Process => {
                vec![Arc::new(self.lock().schedule.request.to_working_mode())]
            }
        }
    }

    pub fn set_attribute(&self, key: &str, value: &str) {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// Exclusive access to a workload's scheduling record.
pub struct WorkloadGuard<'a> {
    id: WorkloadId,
    schedule: MutexGuard<'a, Schedule>,
}

impl WorkloadGuard<'_> {
    pub fn id(&self) -> WorkloadId {
        self.id
    }

    pub fn state(&self) -> State {
        self.schedule.state
    }

    pub fn pre_sync_state(&self) -> State {
        self.schedule.pre_sync_state
    }

    pub fn sync_state(&self) -> SyncState {
        self.schedule.sync_state
    }

    pub fn current(&self) -> Option<&Assignment> {
        self.schedule.current.as_ref()
    }

    pub fn next(&self) -> Option<&Assignment> {
        self.schedule.next.as_ref()
    }

    pub fn schedule_count(&self) -> u64 {
        self.schedule.count
    }

    pub fn block_requested(&self) -> bool {
        self.schedule.block_requested
    }

    pub fn request(&self) -> ScheduleRequest {
        self.schedule.request
    }

    pub fn set_request(&mut self, request: ScheduleRequest) {
        self.schedule.request = request;
    }

    pub fn is_synching(&self) -> bool {
        self.schedule.state == State::Sync
    }

    /// In SYNC towards a different working mode.
    pub fn switching_mode(&self) -> bool {
        match (&self.schedule.current, &self.schedule.next) {
            (Some(c), Some(n)) => self.is_synching() && c.mode.id != n.mode.id,
            _ => false,
        }
    }

    /// Propose the assignment for the next round.
    pub fn set_next(&mut self, assignment: Assignment) {
        self.schedule.next = Some(assignment);
        self.schedule.block_requested = false;
    }

    pub fn clear_next(&mut self) {
        self.schedule.next = None;
    }

    /// Ask for the workload to give back its resources this round.
    pub fn request_block(&mut self) {
        self.schedule.next = None;
        self.schedule.block_requested = true;
    }

    /// Classify the synchronization implied by the proposed assignment.
    pub fn next_sync_state(&self) -> SyncState {
        match &self.schedule.next {
            Some(next) => {
                classify_next_sync(self.schedule.current.as_ref(), next, self.schedule.state)
            }
            None => SyncState::SyncNone,
        }
    }

    /// Move to `next` with the given sync-state.
    pub fn set_state(&mut self, next: State, next_sync: SyncState) -> AppResult<()> {
        let from = self.schedule.state;
        if (next == State::Sync) == (next_sync == SyncState::SyncNone) {
            return Err(AppError::SyncNotExpected {
                state: next,
                sync: next_sync,
            });
        }
        let wrong = AppError::WrongState {
            id: self.id,
            from,
            to: next,
        };
        if from == State::Finished || next == State::New {
            return Err(wrong);
        }

        let s = &mut *self.schedule;
        match next {
            State::Sync => {
                if from != State::Sync {
                    s.pre_sync_state = from;
                }
            }
            State::Running => match from {
                State::Sync => {
                    if s.next.is_none() && s.current.is_none() {
                        return Err(wrong);
                    }
                    if let Some(n) = s.next.take() {
                        s.current = Some(n);
                    }
                    s.count += 1;
                }
                State::Running => s.next = None,
                _ => return Err(wrong),
            },
            State::Ready | State::Finished => {
                s.current = None;
                s.next = None;
            }
            State::Frozen | State::Thawed | State::Restoring => s.next = None,
            State::New => return Err(wrong),
        }

        s.state = next;
        s.sync_state = next_sync;
        s.block_requested = false;
        debug!(id = %self.id, %from, to = %next, sync = %next_sync, "state changed");
        Ok(())
    }

    /// Complete a synchronization. Returns the state reached.
    pub fn sync_commit(&mut self) -> AppResult<State> {
        let target = match self.schedule.sync_state {
            _ if self.schedule.state != State::Sync => None,
            SyncState::Blocked => Some(State::Ready),
            SyncState::Disabled => Some(State::Finished),
            s if s.acquires_resources() => Some(State::Running),
            _ => None,
        };
        let Some(target) = target else {
            return Err(AppError::WrongState {
                id: self.id,
                from: self.schedule.state,
                to: State::Running,
            });
        };
        self.set_state(target, SyncState::SyncNone)?;
        Ok(target)
    }

    /// Abandon a synchronization, restoring the pre-sync state.
    pub fn sync_abort(&mut self) -> AppResult<State> {
        if self.schedule.state != State::Sync {
            return Err(AppError::WrongState {
                id: self.id,
                from: self.schedule.state,
                to: self.schedule.pre_sync_state,
            });
        }
        let s = &mut *self.schedule;
        s.state = s.pre_sync_state;
        s.sync_state = SyncState::SyncNone;
        s.next = None;
        s.block_requested = false;
        debug!(id = %self.id, restored = %s.state, "sync aborted");
        Ok(s.state)
    }

    /// Keep running with the current assignment.
    pub fn sync_continue(&mut self) -> AppResult<()> {
        let s = &mut *self.schedule;
        let resumable = match s.state {
            State::Running => true,
            State::Sync => s.pre_sync_state == State::Running && s.current.is_some(),
            _ => false,
        };
        if !resumable {
            return Err(AppError::WrongState {
                id: self.id,
                from: s.state,
                to: State::Running,
            });
        }
        s.state = State::Running;
        s.sync_state = SyncState::SyncNone;
        s.next = None;
        s.block_requested = false;
        Ok(())
    }

    pub fn snapshot(&self) -> Schedule {
        self.schedule.clone()
    }

    /// Put back a record taken with `snapshot`.
    pub fn restore(&mut self, snapshot: Schedule) {
        debug!(id = %self.id, state = %snapshot.state, "schedule rolled back");
        *self.schedule = snapshot;
    }
}
