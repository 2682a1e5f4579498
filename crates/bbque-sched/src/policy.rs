//! Scheduling policy interface.
//!
//! A policy sees the system through [`SystemView`]: the registry cursors
//! of the workloads it may schedule, plus reservation operations on the
//! candidate view it was handed. Everything a policy books lands in that
//! view; nothing reaches the committed view until the round commits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use bbque_app::{Assignment, State, StateCursor, WorkingMode, Workload, WorkloadRegistry};
use bbque_core::{ResourcePath, WorkloadId};
use bbque_res::{AccountResult, Resource, ResourceAccounter, ResourceBinding, ViewToken};

use crate::error::PolicyError;

/// Decides the next assignment of every schedulable workload.
pub trait SchedulerPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Fill `view` with the reservations of the next assignments and set
    /// each workload's proposed assignment. Returns the view to commit.
    fn schedule(&self, system: &SystemView<'_>, view: ViewToken) -> Result<ViewToken, PolicyError>;
}

/// What a policy may read and change during a round.
pub struct SystemView<'a> {
    registry: &'a WorkloadRegistry,
    accounter: &'a ResourceAccounter,
    binding_refs: &'a AtomicU64,
}

impl<'a> SystemView<'a> {
    pub fn new(
        registry: &'a WorkloadRegistry,
        accounter: &'a ResourceAccounter,
        binding_refs: &'a AtomicU64,
    ) -> Self {
        Self {
            registry,
            accounter,
            binding_refs,
        }
    }

    pub fn ready(&self) -> StateCursor<'a> {
        self.registry.iter(State::Ready)
    }

    pub fn running(&self) -> StateCursor<'a> {
        self.registry.iter(State::Running)
    }

    pub fn thawed(&self) -> StateCursor<'a> {
        self.registry.iter(State::Thawed)
    }

    pub fn restoring(&self) -> StateCursor<'a> {
        self.registry.iter(State::Restoring)
    }

    /// Leaves equal to or below `pattern`.
    pub fn leaves(&self, pattern: &ResourcePath) -> Vec<Resource> {
        self.accounter.leaves(pattern)
    }

    pub fn available(&self, pattern: &ResourcePath, view: ViewToken) -> AccountResult<u64> {
        self.accounter.available(pattern, view)
    }

    pub fn used_by(
        &self,
        workload: WorkloadId,
        pattern: &ResourcePath,
        view: ViewToken,
    ) -> AccountResult<u64> {
        self.accounter.used_by(workload, pattern, view)
    }

    pub fn is_high_performance(&self, path: &ResourcePath) -> bool {
        self.accounter.is_high_performance(path)
    }

    pub fn book(
        &self,
        workload: WorkloadId,
        binding: &ResourceBinding,
        view: ViewToken,
    ) -> AccountResult<()> {
        self.accounter.book(workload, binding, view)
    }

    pub fn release(&self, workload: WorkloadId, view: ViewToken) -> AccountResult<()> {
        self.accounter.release(workload, view)
    }

    /// Book `binding` for the workload, replacing whatever it holds in
    /// `view`, and propose it as the workload's next assignment.
    ///
    /// On failure the previous reservations are put back.
    pub fn assign(
        &self,
        workload: &Workload,
        mode: Arc<WorkingMode>,
        binding: ResourceBinding,
        view: ViewToken,
    ) -> AccountResult<()> {
        let id = workload.id();
        let previous = self.holdings(id, view)?;
        self.accounter.release(id, view)?;
        if let Err(e) = self.accounter.book(id, &binding, view) {
            if !previous.is_empty() {
                self.accounter.book(id, &previous, view)?;
            }
            return Err(e);
        }
        let binding_ref = self.binding_refs.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(%id, mode = %mode.name, binding_ref, "assignment proposed");
        workload
            .lock()
            .set_next(Assignment::new(mode, binding, binding_ref));
        Ok(())
    }

    /// Take every reservation of the workload out of `view` and ask it to
    /// release its resources this round.
    pub fn block(&self, workload: &Workload, view: ViewToken) -> AccountResult<()> {
        self.accounter.release(workload.id(), view)?;
        workload.lock().request_block();
        debug!(id = %workload.id(), "workload blocked");
        Ok(())
    }

    fn holdings(&self, id: WorkloadId, view: ViewToken) -> AccountResult<ResourceBinding> {
        let ledger = self.accounter.snapshot(view)?;
        let mut binding = ResourceBinding::new();
        if let Some(holdings) = ledger.holdings(id) {
            for (path, amount) in holdings {
                binding.bind(path.clone(), *amount);
            }
        }
        Ok(binding)
    }
}
