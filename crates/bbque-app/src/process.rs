//! Tracking of unmodified OS processes.
//!
//! Processes are managed by executable name. Once a managed name starts,
//! the process is registered as a workload and scheduled with the single
//! working mode synthesized from its [`ScheduleRequest`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use bbque_core::{Pid, Priority, WorkloadId};

use crate::error::{AppError, AppResult};
use crate::registry::WorkloadRegistry;
use crate::working_mode::ScheduleRequest;
use crate::workload::{Workload, WorkloadKind};

/// Priority given to tracked processes.
pub const PROCESS_PRIORITY: Priority = 5;

/// Managed process names and their pending schedule requests.
pub struct ProcessManager {
    registry: Arc<WorkloadRegistry>,
    managed: RwLock<BTreeMap<String, ScheduleRequest>>,
}

impl ProcessManager {
    pub fn new(registry: Arc<WorkloadRegistry>) -> Self {
        Self {
            registry,
            managed: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start managing processes with the given executable name.
    pub fn add(&self, name: &str) {
        self.managed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default();
        info!(name, "process name managed");
    }

    /// Stop managing a name. Running instances keep their workloads.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self
            .managed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        info!(name, removed, "process name unmanaged");
        removed
    }

    pub fn is_managed(&self, name: &str) -> bool {
        self.managed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Resource request recorded for a managed name.
    pub fn request(&self, name: &str) -> Option<ScheduleRequest> {
        self.managed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub fn managed(&self) -> Vec<String> {
        self.managed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Set the resource request of a managed name.
    ///
    /// With a pid, the request is also applied to that running instance.
    /// The caller raises the optimization event.
    pub fn set_schedule(
        &self,
        name: &str,
        pid: Option<Pid>,
        request: ScheduleRequest,
    ) -> AppResult<()> {
        {
            let mut managed = self.managed.write().unwrap_or_else(PoisonError::into_inner);
            let slot = managed
                .get_mut(name)
                .ok_or_else(|| AppError::NotManaged(name.to_string()))?;
            *slot = request;
        }
        let targets: Vec<Arc<Workload>> = match pid {
            Some(pid) => {
                let id = WorkloadId::new(pid);
                vec![self.registry.get(id).ok_or(AppError::NotFound(id))?]
            }
            None => self
                .registry
                .all()
                .into_iter()
                .filter(|w| w.is_process() && w.name() == name)
                .collect(),
        };
        for w in targets {
            w.lock().set_request(request);
        }
        debug!(name, ?pid, ?request, "schedule request set");
        Ok(())
    }

    /// A process started. Registers it when its name is managed.
    ///
    /// Returns false for unmanaged names.
    pub fn notify_start(&self, name: &str, pid: Pid) -> AppResult<bool> {
        let Some(request) = self
            .managed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
        else {
            debug!(name, pid, "process not managed, ignored");
            return Ok(false);
        };
        let id = WorkloadId::new(pid);
        let workload = self
            .registry
            .register(id, name, WorkloadKind::Process, PROCESS_PRIORITY)?;
        workload.lock().set_request(request);
        self.registry.notify_start(id)?;
        Ok(true)
    }

    /// A process exited. Returns true when a scheduling round is needed.
    pub fn notify_exit(&self, pid: Pid) -> AppResult<bool> {
        let id = WorkloadId::new(pid);
        match self.registry.get(id) {
            Some(w) if w.is_process() => self.registry.notify_exit(id),
            _ => Err(AppError::NotFound(id)),
        }
    }
}
