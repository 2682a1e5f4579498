//! Reliability paths: freezing, checkpoint/restore, degradation and
//! resource faults.
//!
//! Freezing and checkpointing go straight to the platform; thawing and
//! restoring only move the workload back under the scheduler, which maps
//! it again in the next synchronization round.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use bbque_app::{
    AppError, PROCESS_PRIORITY, ProcessManager, Recipe, State, WorkloadKind, WorkloadRegistry,
};
use bbque_core::{LOWEST_PRIORITY, Pid, Priority, ResourcePath, WorkloadId};
use bbque_res::{AccountError, ResourceAccounter};
use bbque_sched::{EventKind, SchedulerManager};
use bbque_sync::PlatformProxy;

use crate::error::{CommandError, CommandResult};

/// What is needed to register a workload again from its image.
#[derive(Debug, Clone)]
struct Image {
    name: String,
    kind: WorkloadKind,
    priority: Priority,
}

pub struct ReliabilityManager {
    registry: Arc<WorkloadRegistry>,
    accounter: Arc<ResourceAccounter>,
    processes: Arc<ProcessManager>,
    recipes: BTreeMap<String, Arc<Recipe>>,
    platform: Arc<dyn PlatformProxy>,
    scheduler: Arc<SchedulerManager>,
    images: Mutex<BTreeMap<Pid, Image>>,
    period: watch::Sender<u64>,
}

impl ReliabilityManager {
    pub fn new(
        registry: Arc<WorkloadRegistry>,
        accounter: Arc<ResourceAccounter>,
        processes: Arc<ProcessManager>,
        recipes: BTreeMap<String, Arc<Recipe>>,
        platform: Arc<dyn PlatformProxy>,
        scheduler: Arc<SchedulerManager>,
        checkpoint_period_secs: u64,
    ) -> Self {
        let (period, _) = watch::channel(checkpoint_period_secs);
        Self {
            registry,
            accounter,
            processes,
            recipes,
            platform,
            scheduler,
            images: Mutex::new(BTreeMap::new()),
            period,
        }
    }

    /// Stop a workload on the platform and take it out of scheduling.
    /// Its resources stay reserved.
    ///
    /// Waits for the scheduling round in progress, if any.
    pub async fn freeze(&self, pid: Pid) -> CommandResult<()> {
        let _rounds = self.scheduler.pause_rounds().await;
        let id = WorkloadId::new(pid);
        let workload = self.registry.get(id).ok_or(AppError::NotFound(id))?;
        let state = workload.state();
        if !state.is_active() {
            return Err(AppError::WrongState {
                id,
                from: state,
                to: State::Frozen,
            }
            .into());
        }

        self.platform.freeze(id).await?;
        if let Err(e) = self.registry.freeze(id) {
            if let Err(thaw) = self.platform.thaw(id).await {
                error!(%id, error = %thaw, "frozen on the platform only");
            }
            return Err(e.into());
        }
        debug!(%id, name = workload.name(), "frozen on the platform");
        Ok(())
    }

    /// Give a frozen workload back to the scheduler.
    pub async fn thaw(&self, pid: Pid) -> CommandResult<()> {
        let _rounds = self.scheduler.pause_rounds().await;
        self.registry.set_to_thaw(WorkloadId::new(pid))?;
        self.scheduler.notify_event(EventKind::Plat);
        Ok(())
    }

    pub async fn checkpoint(&self, pid: Pid) -> CommandResult<()> {
        let id = WorkloadId::new(pid);
        let workload = self.registry.get(id).ok_or(AppError::NotFound(id))?;
        self.platform.checkpoint(id).await?;
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                pid,
                Image {
                    name: workload.name().to_string(),
                    kind: workload.kind().clone(),
                    priority: workload.priority(),
                },
            );
        info!(%id, name = workload.name(), "checkpoint taken");
        Ok(())
    }

    /// Register a checkpointed workload in RESTORING.
    ///
    /// The image taken by `checkpoint` decides the workload kind. Without
    /// one, a managed process name or a recipe name is accepted.
    pub fn restore(&self, pid: Pid, name: &str) -> CommandResult<()> {
        let id = WorkloadId::new(pid);
        if self.registry.get(id).is_some() {
            return Err(AppError::Duplicate(id).into());
        }

        let image = self
            .images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .filter(|image| image.name == name)
            .cloned();
        let image = match image {
            Some(image) => image,
            None if self.processes.is_managed(name) => Image {
                name: name.to_string(),
                kind: WorkloadKind::Process,
                priority: PROCESS_PRIORITY,
            },
            None => {
                let recipe = self
                    .recipes
                    .get(name)
                    .ok_or_else(|| CommandError::UnknownRecipe(name.to_string()))?;
                Image {
                    name: name.to_string(),
                    kind: WorkloadKind::Adaptive(Arc::clone(recipe)),
                    priority: LOWEST_PRIORITY,
                }
            }
        };

        let workload = self
            .registry
            .restore(id, &image.name, image.kind, image.priority)?;
        if workload.is_process() {
            if let Some(request) = self.processes.request(&image.name) {
                workload.lock().set_request(request);
            }
        }
        info!(%id, name = %image.name, "workload restoring");
        self.scheduler.notify_event(EventKind::Plat);
        Ok(())
    }

    /// Record degradation percentages given as `<path> <pct>` pairs.
    ///
    /// Invalid pairs are skipped. Returns how many were applied.
    pub fn notify_degradation(&self, pairs: &[String]) -> CommandResult<usize> {
        if pairs.is_empty() || pairs.len() % 2 != 0 {
            return Err(CommandError::Usage(
                "expecting <resource path> <percentage> pairs".to_string(),
            ));
        }

        let mut applied = 0;
        for pair in pairs.chunks(2) {
            let (path, value) = (&pair[0], &pair[1]);
            let Ok(percent) = value.parse::<u8>() else {
                warn!(path = %path, value = %value, "not a degradation percentage");
                continue;
            };
            let result = path
                .parse::<ResourcePath>()
                .map_err(AccountError::from)
                .and_then(|p| self.accounter.notify_degradation(&p, percent));
            match result {
                Ok(()) => applied += 1,
                Err(e) => warn!(path = %path, error = %e, "degradation ignored"),
            }
        }
        Ok(applied)
    }

    /// Handle a fault on every leaf matching `pattern`.
    ///
    /// The workloads holding a faulty leaf are frozen, the leaf goes
    /// offline, and a platform round is requested. Returns the number of
    /// leaves taken offline.
    pub async fn simulate_fault(&self, pattern: &str) -> CommandResult<usize> {
        let pattern: ResourcePath = pattern.parse().map_err(AccountError::from)?;
        let leaves = self.accounter.leaves(&pattern);
        if leaves.is_empty() {
            return Err(AccountError::BadPath(pattern.to_string()).into());
        }

        let committed = self.accounter.snapshot(self.accounter.committed_token())?;
        let reservations = committed.reservations();
        for leaf in &leaves {
            let users: BTreeSet<WorkloadId> = reservations
                .iter()
                .filter(|r| r.path == leaf.path)
                .map(|r| r.workload)
                .collect();
            warn!(path = %leaf.path, users = users.len(), "resource fault");

            for id in users {
                if let Err(e) = self.freeze(id.pid).await {
                    warn!(%id, error = %e, "workload on faulty resource not frozen");
                }
            }
            self.accounter.set_offline(&leaf.path, leaf.capacity)?;
        }

        self.scheduler.notify_event(EventKind::Plat);
        Ok(leaves.len())
    }

    /// Change the periodic checkpoint interval. `None` disables it.
    pub fn set_checkpoint_period(&self, period: Option<Duration>) {
        let secs = period.map(|p| p.as_secs().max(1)).unwrap_or(0);
        self.period.send_replace(secs);
        info!(period_secs = secs, "checkpoint period set");
    }

    pub fn checkpoint_period(&self) -> Option<Duration> {
        match *self.period.borrow() {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Checkpoint every running workload.
    pub async fn checkpoint_running(&self) -> usize {
        let mut done = 0;
        for w in self.registry.iter(State::Running) {
            match self.checkpoint(w.id().pid).await {
                Ok(()) => done += 1,
                Err(e) => warn!(id = %w.id(), error = %e, "periodic checkpoint failed"),
            }
        }
        done
    }

    /// Periodic checkpoint loop. Follows period changes until shutdown.
    pub async fn run_checkpoints(&self, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.period.subscribe();
        info!("checkpoint task started");

        loop {
            let current = *period.borrow_and_update();
            if current == 0 {
                tokio::select! {
                    changed = period.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(current)) => {
                    let done = self.checkpoint_running().await;
                    debug!(checkpoints = done, "periodic checkpoint");
                }
                changed = period.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("checkpoint task shutting down");
    }
}
