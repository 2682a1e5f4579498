//! Scheduler driver: runs scheduling rounds on demand.
//!
//! A round opens a candidate view, lets the policy fill it, classifies the
//! resulting changes, and hands the plan to the synchronization manager.
//! Rounds never overlap; events raised while one runs are served by the
//! next.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use bbque_app::{State, SyncState, Workload, WorkloadRegistry};
use bbque_core::config::SchedulerConfig;
use bbque_metrics::MetricsCollector;
use bbque_res::{ResourceAccounter, ViewToken};
use bbque_sync::{SyncCandidate, SyncOutcome, SynchronizationManager};

use crate::error::{SchedError, SchedResult};
use crate::events::{EventKind, EventQueue};
use crate::policy::{SchedulerPolicy, SystemView};

/// How a round ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// No workload to schedule.
    Empty,
    /// The policy changed nothing that needs synchronization.
    Unchanged,
    Synced(SyncOutcome),
}

/// States whose workloads a policy may assign.
const SCHEDULABLE: [State; 4] = [State::Ready, State::Running, State::Thawed, State::Restoring];

pub struct SchedulerManager {
    registry: Arc<WorkloadRegistry>,
    accounter: Arc<ResourceAccounter>,
    policy: Arc<dyn SchedulerPolicy>,
    sync: Arc<SynchronizationManager>,
    metrics: Arc<MetricsCollector>,
    config: SchedulerConfig,
    events: EventQueue,
    round_lock: Mutex<()>,
    binding_refs: AtomicU64,
}

impl SchedulerManager {
    pub fn new(
        registry: Arc<WorkloadRegistry>,
        accounter: Arc<ResourceAccounter>,
        policy: Arc<dyn SchedulerPolicy>,
        sync: Arc<SynchronizationManager>,
        metrics: Arc<MetricsCollector>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            accounter,
            policy,
            sync,
            metrics,
            config,
            events: EventQueue::new(),
            round_lock: Mutex::new(()),
            binding_refs: AtomicU64::new(0),
        }
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Request a round. Returns immediately.
    pub fn notify_event(&self, kind: EventKind) {
        debug!(event = %kind, "scheduling event");
        self.events.raise(kind);
    }

    /// Serve events until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(policy = self.policy.name(), "scheduler started");
        let defer = Duration::from_millis(self.config.opts_defer_ms);

        loop {
            tokio::select! {
                _ = self.events.wait() => {}
                _ = shutdown.changed() => {
                    info!("scheduler shutting down");
                    break;
                }
            }

            if self.events.peek().only_opts() && !defer.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(defer) => {}
                    _ = shutdown.changed() => {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }

            let mask = self.events.take();
            if mask.is_empty() {
                continue;
            }
            if mask.contains(EventKind::Usr1) {
                self.dump_status();
            }
            if let Err(e) = self.schedule().await {
                error!(error = %e, "scheduling round failed");
            }
        }
    }

    /// Keep rounds from starting while the guard lives. Waits for the
    /// round in progress, if any.
    pub async fn pause_rounds(&self) -> MutexGuard<'_, ()> {
        self.round_lock.lock().await
    }

    /// Run one scheduling round.
    pub async fn schedule(&self) -> SchedResult<RoundOutcome> {
        let _round = self.round_lock.lock().await;
        self.metrics.record_sched_run();

        if !self.registry.has_pending() {
            debug!("nothing to schedule");
            self.metrics.record_sched_empty();
            return Ok(RoundOutcome::Empty);
        }

        let view = self.accounter.open_view("sched")?;
        let system = SystemView::new(&self.registry, &self.accounter, &self.binding_refs);
        let view = match self.policy.schedule(&system, view) {
            Ok(token) if token == view => view,
            Ok(token) => {
                self.accounter.discard(view)?;
                token
            }
            Err(e) => {
                warn!(policy = self.policy.name(), error = %e, "policy failed");
                self.clear_proposals();
                self.accounter.discard(view)?;
                self.metrics.record_sched_failed();
                return Err(SchedError::Policy(e));
            }
        };

        for w in self.registry.iter_sync(SyncState::Disabled) {
            self.accounter.release(w.id(), view)?;
        }

        let mut candidates = Vec::new();
        for state in SCHEDULABLE {
            for w in self.registry.iter(state) {
                if let Some(candidate) = self.classify(&w, view) {
                    candidates.push(candidate);
                }
            }
        }
        for w in self.registry.iter_sync(SyncState::Disabled) {
            candidates.push(candidate_of(&w));
        }

        let plan = self.sync.policy().plan(&candidates);
        if plan.is_empty() {
            debug!(%view, "no change to synchronize");
            self.accounter.discard(view)?;
            return Ok(RoundOutcome::Unchanged);
        }

        let outcome = self.sync.commit(&plan, view).await?;
        if outcome.needs_platform_round() {
            self.notify_event(EventKind::Plat);
        }
        Ok(RoundOutcome::Synced(outcome))
    }

    /// Log the registry and committed usage.
    pub fn dump_status(&self) {
        info!(
            policy = self.policy.name(),
            workloads = self.registry.len(),
            ready = self.registry.count(State::Ready),
            running = self.registry.count(State::Running),
            frozen = self.registry.count(State::Frozen),
            "scheduler status"
        );
        self.registry.print_status();
        self.accounter.status(self.accounter.committed_token());
    }

    // ── Internal helpers ───────────────────────────────────────

    /// Move a workload towards SYNC according to its proposal.
    ///
    /// Returns the sync candidate, or `None` when nothing changes. A
    /// workload whose transition fails is reverted alone.
    fn classify(&self, w: &Workload, view: ViewToken) -> Option<SyncCandidate> {
        let result = self.registry.update(w, |g| {
            if g.block_requested() {
                if g.current().is_some() {
                    g.set_state(State::Sync, SyncState::Blocked)?;
                    return Ok(Some(SyncState::Blocked));
                }
                return Ok(None);
            }
            if g.next().is_none() {
                return Ok(None);
            }
            match g.next_sync_state() {
                SyncState::SyncNone => {
                    g.sync_continue()?;
                    Ok(Some(SyncState::SyncNone))
                }
                sync => {
                    g.set_state(State::Sync, sync)?;
                    Ok(Some(sync))
                }
            }
        });

        match result {
            Ok(Some(SyncState::SyncNone)) => {
                if let Err(e) = self.accounter.revert_to_committed(w.id(), view) {
                    debug!(id = %w.id(), error = %e, "kept proposed amounts");
                }
                None
            }
            Ok(Some(_)) => Some(candidate_of(w)),
            Ok(None) => None,
            Err(e) => {
                warn!(id = %w.id(), error = %e, "workload dropped from round");
                w.lock().clear_next();
                if let Err(e) = self.accounter.revert_to_committed(w.id(), view) {
                    warn!(id = %w.id(), error = %e, "revert failed");
                }
                None
            }
        }
    }

    fn clear_proposals(&self) {
        for state in SCHEDULABLE {
            for w in self.registry.iter(state) {
                w.lock().clear_next();
            }
        }
    }
}

fn candidate_of(w: &Workload) -> SyncCandidate {
    let g = w.lock();
    SyncCandidate {
        id: w.id(),
        sync_state: g.sync_state(),
        priority: w.priority(),
        prev_value: g.current().map(|a| a.value()),
        next_value: g.next().map(|a| a.value()),
    }
}
