//! Workload registry: owns every schedulable workload.
//!
//! Workloads are indexed by id and by (sync-)state. The per-state indices
//! are ordered by priority, so iteration hands policies the most important
//! workloads first.
//!
//! Lock order: workload → registry. The registry lock is never held while
//! a workload is locked from inside the registry.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use bbque_core::{Priority, WorkloadId};

use crate::error::{AppError, AppResult};
use crate::state::{State, SyncState};
use crate::workload::{Schedule, Workload, WorkloadKind};

/// Priority queue key: most important first, then by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Priority,
    id: WorkloadId,
}

#[derive(Default)]
struct RegistryInner {
    all: BTreeMap<WorkloadId, Arc<Workload>>,
    by_state: BTreeMap<State, BTreeSet<QueueKey>>,
    by_sync: BTreeMap<SyncState, BTreeSet<QueueKey>>,
}

impl RegistryInner {
    fn reindex(&mut self, key: QueueKey, old: (State, SyncState), new: (State, SyncState)) {
        if old == new {
            return;
        }
        if let Some(q) = self.by_state.get_mut(&old.0) {
            q.remove(&key);
        }
        if let Some(q) = self.by_sync.get_mut(&old.1) {
            q.remove(&key);
        }
        self.by_state.entry(new.0).or_default().insert(key);
        if new.0 == State::Sync {
            self.by_sync.entry(new.1).or_default().insert(key);
        }
    }
}

/// Lifetime-managed set of workloads.
#[derive(Default)]
pub struct WorkloadRegistry {
    inner: RwLock<RegistryInner>,
    cursors: AtomicUsize,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a workload in `NEW`.
    pub fn register(
        &self,
        id: WorkloadId,
        name: &str,
        kind: WorkloadKind,
        priority: Priority,
    ) -> AppResult<Arc<Workload>> {
        let mut inner = self.write();
        if inner.all.contains_key(&id) {
            return Err(AppError::Duplicate(id));
        }
        let workload = Arc::new(Workload::new(id, name, kind, priority));
        inner.all.insert(id, Arc::clone(&workload));
        inner
            .by_state
            .entry(State::New)
            .or_default()
            .insert(QueueKey { priority, id });
        info!(%id, name, priority, process = workload.is_process(), "workload registered");
        Ok(workload)
    }

    pub fn get(&self, id: WorkloadId) -> Option<Arc<Workload>> {
        self.read().all.get(&id).cloned()
    }

    /// The workload, if it is currently in `state`.
    pub fn get_if_in_state(&self, id: WorkloadId, state: State) -> Option<Arc<Workload>> {
        let workload = self.get(id)?;
        (workload.state() == state).then_some(workload)
    }

    /// Cursor over the workloads in `state`, in priority order.
    pub fn iter(&self, state: State) -> StateCursor<'_> {
        let ids = self
            .read()
            .by_state
            .get(&state)
            .map(|q| q.iter().map(|k| k.id).collect())
            .unwrap_or_default();
        StateCursor::new(self, ids, Filter::State(state))
    }

    /// Cursor over the synching workloads with the given sync-state.
    pub fn iter_sync(&self, sync: SyncState) -> StateCursor<'_> {
        let ids = self
            .read()
            .by_sync
            .get(&sync)
            .map(|q| q.iter().map(|k| k.id).collect())
            .unwrap_or_default();
        StateCursor::new(self, ids, Filter::Sync(sync))
    }

    /// Every workload, by id.
    pub fn all(&self) -> Vec<Arc<Workload>> {
        self.read().all.values().cloned().collect()
    }

    pub fn count(&self, state: State) -> usize {
        self.read().by_state.get(&state).map_or(0, BTreeSet::len)
    }

    pub fn count_sync(&self, sync: SyncState) -> usize {
        self.read().by_sync.get(&sync).map_or(0, BTreeSet::len)
    }

    pub fn has(&self, state: State) -> bool {
        self.count(state) > 0
    }

    pub fn has_sync(&self, sync: SyncState) -> bool {
        self.count_sync(sync) > 0
    }

    /// Any workload waiting for, or holding, resources.
    pub fn has_pending(&self) -> bool {
        State::ALL
            .iter()
            .any(|s| (s.is_pending() || *s == State::Sync) && self.has(*s))
    }

    pub fn len(&self) -> usize {
        self.read().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().all.is_empty()
    }

    /// Cursors currently open on this registry.
    pub fn open_cursors(&self) -> usize {
        self.cursors.load(Ordering::Relaxed)
    }

    // ── Transitions ────────────────────────────────────────────

    /// Run `f` on the pinned workload and keep the indices in step with it.
    pub fn update<R>(
        &self,
        workload: &Workload,
        f: impl FnOnce(&mut crate::workload::WorkloadGuard<'_>) -> AppResult<R>,
    ) -> AppResult<R> {
        let mut guard = workload.lock();
        let old = (guard.state(), guard.sync_state());
        let result = f(&mut guard)?;
        let new = (guard.state(), guard.sync_state());
        let key = QueueKey {
            priority: workload.priority(),
            id: workload.id(),
        };
        let mut inner = self.write();
        if inner.all.contains_key(&workload.id()) {
            inner.reindex(key, old, new);
        }
        Ok(result)
    }

    pub fn set_state(&self, workload: &Workload, next: State, sync: SyncState) -> AppResult<()> {
        self.update(workload, |g| g.set_state(next, sync))
    }

    /// Enable a newly registered workload for scheduling.
    pub fn notify_start(&self, id: WorkloadId) -> AppResult<()> {
        let workload = self.get(id).ok_or(AppError::NotFound(id))?;
        self.update(&workload, |g| {
            if g.state() != State::New {
                return Err(AppError::WrongState {
                    id,
                    from: g.state(),
                    to: State::Ready,
                });
            }
            g.set_state(State::Ready, SyncState::SyncNone)
        })?;
        info!(%id, "workload ready");
        Ok(())
    }

    /// Handle the exit of a workload.
    ///
    /// A workload holding resources is disabled and released by the next
    /// round; one holding nothing is finished and removed right away.
    /// Returns true when a scheduling round is needed.
    pub fn notify_exit(&self, id: WorkloadId) -> AppResult<bool> {
        let workload = self.get(id).ok_or(AppError::NotFound(id))?;
        let needs_round = self.update(&workload, |g| match g.state() {
            State::Frozen => Err(AppError::WrongState {
                id,
                from: State::Frozen,
                to: State::Finished,
            }),
            State::Finished => Ok(false),
            State::Sync if g.sync_state() == SyncState::Disabled => Ok(true),
            _ if g.current().is_some() => {
                g.set_state(State::Sync, SyncState::Disabled)?;
                Ok(true)
            }
            _ => {
                g.set_state(State::Finished, SyncState::SyncNone)?;
                Ok(false)
            }
        })?;
        if !needs_round {
            self.reap_finished();
        }
        info!(%id, needs_round, "workload exit");
        Ok(needs_round)
    }

    /// Move a workload out of service, keeping its assignment.
    pub fn freeze(&self, id: WorkloadId) -> AppResult<()> {
        let workload = self.get(id).ok_or(AppError::NotFound(id))?;
        self.update(&workload, |g| {
            if !g.state().is_active() {
                return Err(AppError::WrongState {
                    id,
                    from: g.state(),
                    to: State::Frozen,
                });
            }
            g.set_state(State::Frozen, SyncState::SyncNone)
        })?;
        info!(%id, "workload frozen");
        Ok(())
    }

    /// Flip a frozen workload towards THAWED.
    pub fn set_to_thaw(&self, id: WorkloadId) -> AppResult<()> {
        let workload = self.get(id).ok_or(AppError::NotFound(id))?;
        self.update(&workload, |g| {
            if g.state() != State::Frozen {
                return Err(AppError::WrongState {
                    id,
                    from: g.state(),
                    to: State::Thawed,
                });
            }
            g.set_state(State::Thawed, SyncState::SyncNone)
        })?;
        info!(%id, "workload set to thaw");
        Ok(())
    }

    /// Register a workload brought back from a checkpoint.
    pub fn restore(
        &self,
        id: WorkloadId,
        name: &str,
        kind: WorkloadKind,
        priority: Priority,
    ) -> AppResult<Arc<Workload>> {
        let workload = self.register(id, name, kind, priority)?;
        self.set_state(&workload, State::Restoring, SyncState::SyncNone)?;
        Ok(workload)
    }

    pub fn sync_commit(&self, workload: &Workload) -> AppResult<State> {
        self.update(workload, |g| g.sync_commit())
    }

    pub fn sync_abort(&self, workload: &Workload) -> AppResult<State> {
        self.update(workload, |g| g.sync_abort())
    }

    pub fn sync_continue(&self, workload: &Workload) -> AppResult<()> {
        self.update(workload, |g| g.sync_continue())
    }

    /// Terminate a workload regardless of its state.
    pub fn finish(&self, workload: &Workload) -> AppResult<()> {
        self.update(workload, |g| {
            if g.state() == State::Finished {
                return Ok(());
            }
            g.set_state(State::Finished, SyncState::SyncNone)
        })
    }

    /// Put back a schedule snapshot taken before a round.
    pub fn rollback(&self, workload: &Workload, snapshot: Schedule) -> AppResult<()> {
        self.update(workload, |g| {
            g.restore(snapshot);
            Ok(())
        })
    }

    /// Drop every FINISHED workload. Returns the removed ids.
    pub fn reap_finished(&self) -> Vec<WorkloadId> {
        let mut inner = self.write();
        let finished: Vec<QueueKey> = inner
            .by_state
            .remove(&State::Finished)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();
        let mut removed = Vec::with_capacity(finished.len());
        for key in finished {
            if inner.all.remove(&key.id).is_some() {
                removed.push(key.id);
            }
        }
        drop(inner);
        for id in &removed {
            debug!(%id, "workload removed");
        }
        removed
    }

    /// Log a one-line summary per workload.
    pub fn print_status(&self) {
        for w in self.all() {
            let g = w.lock();
            info!(
                id = %w.id(),
                name = w.name(),
                priority = w.priority(),
                state = %g.state(),
                sync = %g.sync_state(),
                mode = g.current().map(|a| a.mode.name.as_str()).unwrap_or("-"),
                count = g.schedule_count(),
                "workload status"
            );
        }
    }

    // ── Internal helpers ───────────────────────────────────────

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
enum Filter {
    State(State),
    Sync(SyncState),
}

/// Snapshot cursor over one state index.
///
/// The ids are captured when the cursor opens; each one is re-validated
/// against the registry when the cursor reaches it, so workloads that
/// leave the state meanwhile are skipped and none is visited twice.
pub struct StateCursor<'a> {
    registry: &'a WorkloadRegistry,
    ids: VecDeque<WorkloadId>,
    filter: Filter,
}

impl<'a> StateCursor<'a> {
    fn new(registry: &'a WorkloadRegistry, ids: VecDeque<WorkloadId>, filter: Filter) -> Self {
        registry.cursors.fetch_add(1, Ordering::Relaxed);
        Self {
            registry,
            ids,
            filter,
        }
    }
}

impl Iterator for StateCursor<'_> {
    type Item = Arc<Workload>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.ids.pop_front() {
            let found = match self.filter {
                Filter::State(state) => self.registry.get_if_in_state(id, state),
                Filter::Sync(sync) => self
                    .registry
                    .get_if_in_state(id, State::Sync)
                    .filter(|w| w.sync_state() == sync),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

impl Drop for StateCursor<'_> {
    fn drop(&mut self) {
        self.registry.cursors.fetch_sub(1, Ordering::Relaxed);
    }
}
