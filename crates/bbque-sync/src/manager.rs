//! Synchronization manager: applies a sync plan to workloads and platform.
//!
//! Cohorts run one after the other. Inside a cohort every workload goes
//! through the four protocol phases in parallel:
//!
//! ```text
//! PreChange   announce the change, collect sync latencies   (retry once)
//! SyncChange  wait for the sync point, deadline from latency (retry once)
//! DoChange    map on the platform, then tell the workload to switch
//! PostChange  collect the outcome: commit, abort, or continue
//! ```
//!
//! Process workloads and exiting workloads skip the messaging phases.
//! Failures stay with the workload that produced them, except a platform
//! crash, which rolls the whole round back.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use bbque_app::{Schedule, State, SyncState, Workload, WorkloadRegistry};
use bbque_core::WorkloadId;
use bbque_core::config::SyncConfig;
use bbque_metrics::{MetricsCollector, Phase};
use bbque_res::{ResourceAccounter, ViewToken};

use crate::error::{PlatformError, RpcError, SyncResult};
use crate::liveness::ProcessLiveness;
use crate::platform::PlatformProxy;
use crate::rpc::{ChangeSummary, PostReply, SyncReply, WorkloadRpc};
use crate::sasb::{SyncPlan, SyncPolicy};

/// Attempts after the first for PreChange and SyncChange.
const PHASE_RETRIES: u32 = 1;

/// What happened to the workloads of one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub round: u64,
    pub committed: Vec<WorkloadId>,
    pub aborted: Vec<WorkloadId>,
    /// Found dead during the round.
    pub finished: Vec<WorkloadId>,
    /// Aborted, but their committed reservation no longer fits the view.
    pub forced_ready: Vec<WorkloadId>,
    pub adopted: bool,
    pub rolled_back: bool,
}

impl SyncOutcome {
    /// The platform changed under the round; schedule again.
    pub fn needs_platform_round(&self) -> bool {
        !self.forced_ready.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    /// Failed a phase; aborted in PostChange.
    Failed,
    /// Settled before PostChange.
    Done,
}

struct Member {
    workload: Arc<Workload>,
    sync_state: SyncState,
    pre_sync: State,
    status: Status,
}

impl Member {
    /// Goes through the messaging phases.
    fn talks(&self) -> bool {
        self.status == Status::Pending
            && !self.workload.is_process()
            && self.sync_state != SyncState::Disabled
    }
}

#[derive(Debug)]
enum PhaseFailure {
    Timeout,
    Rpc(RpcError),
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseFailure::Timeout => f.write_str("timeout"),
            PhaseFailure::Rpc(e) => write!(f, "{e}"),
        }
    }
}

/// Drives the commit protocol of scheduling rounds.
pub struct SynchronizationManager {
    registry: Arc<WorkloadRegistry>,
    accounter: Arc<ResourceAccounter>,
    policy: Arc<dyn SyncPolicy>,
    rpc: Arc<dyn WorkloadRpc>,
    platform: Arc<dyn PlatformProxy>,
    liveness: Arc<dyn ProcessLiveness>,
    metrics: Arc<MetricsCollector>,
    config: SyncConfig,
    round: AtomicU64,
}

impl SynchronizationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<WorkloadRegistry>,
        accounter: Arc<ResourceAccounter>,
        policy: Arc<dyn SyncPolicy>,
        rpc: Arc<dyn WorkloadRpc>,
        platform: Arc<dyn PlatformProxy>,
        liveness: Arc<dyn ProcessLiveness>,
        metrics: Arc<MetricsCollector>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            accounter,
            policy,
            rpc,
            platform,
            liveness,
            metrics,
            config,
            round: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &dyn SyncPolicy {
        self.policy.as_ref()
    }

    /// Last round token handed out.
    pub fn current_round(&self) -> u64 {
        self.round.load(Ordering::Relaxed)
    }

    /// Apply `plan`, whose reservations are booked in `view`.
    ///
    /// The view is adopted unless every planned workload aborted, in which
    /// case it is discarded. Queued power settings are actuated after an
    /// adopt.
    pub async fn commit(&self, plan: &SyncPlan, view: ViewToken) -> SyncResult<SyncOutcome> {
        let round = self.round.fetch_add(1, Ordering::Relaxed) + 1;
        let mut outcome = SyncOutcome {
            round,
            ..Default::default()
        };
        self.metrics.record_sync_start();
        info!(round, %view, workloads = plan.len(), "sync round started");

        let mut cohorts = Vec::with_capacity(plan.cohorts.len());
        let mut snapshots: Vec<(Arc<Workload>, Schedule)> = Vec::with_capacity(plan.len());
        for cohort in &plan.cohorts {
            let mut members = Vec::with_capacity(cohort.members.len());
            for id in &cohort.members {
                let Some(workload) = self.registry.get_if_in_state(*id, State::Sync) else {
                    warn!(round, %id, "planned workload no longer synching, skipped");
                    continue;
                };
                let (sync_state, pre_sync, snapshot) = {
                    let g = workload.lock();
                    (g.sync_state(), g.pre_sync_state(), g.snapshot())
                };
                snapshots.push((Arc::clone(&workload), snapshot));
                members.push(Member {
                    workload,
                    sync_state,
                    pre_sync,
                    status: Status::Pending,
                });
            }
            if !members.is_empty() {
                cohorts.push((cohort.step, cohort.sync_state, members));
            }
        }

        for (step, sync_state, mut members) in cohorts {
            debug!(round, step, %sync_state, members = members.len(), "cohort");
            for _ in &members {
                self.metrics.record_sync_state(sync_state);
            }

            self.pre_change(round, view, &mut members, &mut outcome).await;
            self.sync_change(round, view, &mut members, &mut outcome).await;
            if let Err(e) = self.do_change(round, view, &mut members, &mut outcome).await {
                error!(round, error = %e, "platform crashed, rolling back round");
                self.rollback(&snapshots, view)?;
                self.metrics.record_round_aborted();
                return Ok(SyncOutcome {
                    round,
                    rolled_back: true,
                    ..Default::default()
                });
            }
            self.post_change(round, view, &mut members, &mut outcome).await;
        }

        self.finalize(view, &mut outcome).await?;
        self.metrics.record_sync_end(
            outcome.committed.len() as u64,
            (outcome.aborted.len() + outcome.forced_ready.len()) as u64,
        );
        info!(
            round,
            committed = outcome.committed.len(),
            aborted = outcome.aborted.len(),
            finished = outcome.finished.len(),
            forced_ready = outcome.forced_ready.len(),
            adopted = outcome.adopted,
            "sync round done"
        );
        Ok(outcome)
    }

    // ── Phases ─────────────────────────────────────────────────

    async fn pre_change(
        &self,
        round: u64,
        view: ViewToken,
        members: &mut [Member],
        outcome: &mut SyncOutcome,
    ) {
        let started = Instant::now();
        let limit = self.config.rpc_timeout();
        let mut tasks = JoinSet::new();
        for (i, m) in members.iter().enumerate().filter(|(_, m)| m.talks()) {
            let summary = {
                let g = m.workload.lock();
                ChangeSummary::new(g.sync_state(), g.next())
            };
            let rpc = Arc::clone(&self.rpc);
            let id = m.workload.id();
            tasks.spawn(async move {
                let result = call_with_retry(limit, PHASE_RETRIES, || {
                    rpc.pre_change(round, id, summary.clone())
                })
                .await;
                (i, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, Ok(latency))) => {
                    let id = members[i].workload.id();
                    debug!(round, %id, latency_ms = latency.as_millis() as u64, "pre-change ok");
                    self.policy.check_latency(id, latency);
                }
                Ok((i, Err(e))) => failed.push((i, e)),
                Err(e) => error!(round, error = %e, "pre-change task failed"),
            }
        }
        for (i, e) in failed {
            let id = members[i].workload.id();
            warn!(round, %id, error = %e, "pre-change failed");
            // The workload is as slow as the whole budget.
            self.policy.check_latency(id, limit);
            self.mark_failed(&mut members[i], view, outcome).await;
        }
        self.metrics.record_phase(Phase::PreChange, started.elapsed()).await;
    }

    async fn sync_change(
        &self,
        round: u64,
        view: ViewToken,
        members: &mut [Member],
        outcome: &mut SyncOutcome,
    ) {
        let started = Instant::now();
        let deadline = self.sync_deadline();
        let mut tasks = JoinSet::new();
        for (i, m) in members.iter().enumerate().filter(|(_, m)| m.talks()) {
            let rpc = Arc::clone(&self.rpc);
            let id = m.workload.id();
            tasks.spawn(async move {
                let result =
                    call_with_retry(deadline, PHASE_RETRIES, || rpc.sync_change(round, id)).await;
                (i, result)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(e) => error!(round, error = %e, "sync-change task failed"),
            }
        }
        for (i, reply) in replies {
            let id = members[i].workload.id();
            match reply {
                Ok(SyncReply::Ok) => debug!(round, %id, "sync-change ok"),
                Ok(SyncReply::Refused) => {
                    info!(round, %id, "sync-change refused");
                    self.abort(&members[i].workload, view, outcome).await;
                    members[i].status = Status::Done;
                }
                Err(e) => {
                    warn!(round, %id, deadline_ms = deadline.as_millis() as u64, error = %e, "sync-change failed");
                    self.mark_failed(&mut members[i], view, outcome).await;
                }
            }
        }
        self.metrics.record_phase(Phase::SyncChange, started.elapsed()).await;
    }

    /// Platform mapping, then the switch order.
    ///
    /// Errors only on a platform crash.
    async fn do_change(
        &self,
        round: u64,
        view: ViewToken,
        members: &mut [Member],
        outcome: &mut SyncOutcome,
    ) -> Result<(), PlatformError> {
        let started = Instant::now();
        for m in members.iter_mut().filter(|m| m.status == Status::Pending) {
            match self.map_platform(m).await {
                Ok(()) => {}
                Err(e @ PlatformError::Crashed(_)) => return Err(e),
                Err(e) => {
                    let id = m.workload.id();
                    if m.sync_state != SyncState::Disabled && !self.liveness.is_alive(id.pid) {
                        self.finish_dead(&m.workload, view, outcome).await;
                        m.status = Status::Done;
                    } else {
                        warn!(round, %id, sync = %m.sync_state, error = %e, "platform mapping failed");
                        m.status = Status::Failed;
                    }
                }
            }
        }

        let mut tasks = JoinSet::new();
        for m in members.iter().filter(|m| m.talks()) {
            let rpc = Arc::clone(&self.rpc);
            let id = m.workload.id();
            tasks.spawn(async move { rpc.do_change(round, id).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(round, error = %e, "do-change task failed");
            }
        }
        self.metrics.record_phase(Phase::DoChange, started.elapsed()).await;
        Ok(())
    }

    async fn post_change(
        &self,
        round: u64,
        view: ViewToken,
        members: &mut [Member],
        outcome: &mut SyncOutcome,
    ) {
        let started = Instant::now();
        let limit = self.config.rpc_timeout();
        let mut tasks = JoinSet::new();
        for (i, m) in members.iter().enumerate().filter(|(_, m)| m.talks()) {
            let rpc = Arc::clone(&self.rpc);
            let id = m.workload.id();
            tasks.spawn(async move {
                let result = call_with_retry(limit, 0, || rpc.post_change(round, id)).await;
                (i, result)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reply) => replies.push(reply),
                Err(e) => error!(round, error = %e, "post-change task failed"),
            }
        }
        let mut answered = vec![false; members.len()];
        for (i, reply) in replies {
            answered[i] = true;
            let workload = Arc::clone(&members[i].workload);
            let id = workload.id();
            match reply {
                Ok(PostReply::Ok) => self.commit_one(&workload, view, outcome).await,
                Ok(PostReply::Continue) => match self.registry.sync_continue(&workload) {
                    Ok(()) => {
                        debug!(round, %id, "post-change continue");
                        self.revert_view(&workload, view, outcome, false);
                    }
                    Err(e) => {
                        debug!(round, %id, error = %e, "continue without assignment, aborting");
                        self.abort(&workload, view, outcome).await;
                    }
                },
                Ok(PostReply::Abort) => {
                    info!(round, %id, "post-change abort");
                    self.abort(&workload, view, outcome).await;
                }
                Err(e) => {
                    warn!(round, %id, error = %e, "post-change failed, aborting");
                    self.abort(&workload, view, outcome).await;
                }
            }
            members[i].status = Status::Done;
        }

        for (i, m) in members.iter_mut().enumerate() {
            match m.status {
                Status::Done => {}
                Status::Failed => self.abort(&m.workload, view, outcome).await,
                Status::Pending if !answered[i] && !m.talks() => {
                    self.commit_one(&m.workload, view, outcome).await
                }
                // A task that panicked or was cancelled.
                Status::Pending => self.abort(&m.workload, view, outcome).await,
            }
            m.status = Status::Done;
        }
        self.metrics.record_phase(Phase::PostChange, started.elapsed()).await;
    }

    // ── Per-workload outcomes ──────────────────────────────────

    async fn map_platform(&self, m: &Member) -> Result<(), PlatformError> {
        let id = m.workload.id();
        match m.pre_sync {
            State::Restoring => self.platform.restore(id).await?,
            State::Thawed => self.platform.thaw(id).await?,
            _ => {}
        }
        match m.sync_state {
            SyncState::Starting | SyncState::Reconf | SyncState::MigRec | SyncState::Migrate => {
                let Some(next) = m.workload.next() else {
                    return Err(PlatformError::MappingFailed {
                        id,
                        reason: "no assignment to map".into(),
                    });
                };
                self.platform.map_resources(id, &next.binding).await
            }
            SyncState::Blocked => self.platform.reclaim(id).await,
            SyncState::Disabled => {
                if let Err(e) = self.platform.release(id).await {
                    debug!(%id, error = %e, "platform release failed");
                }
                Ok(())
            }
            SyncState::SyncNone => Ok(()),
        }
    }

    async fn commit_one(&self, workload: &Workload, view: ViewToken, outcome: &mut SyncOutcome) {
        let id = workload.id();
        match self.registry.sync_commit(workload) {
            Ok(state) => {
                debug!(%id, %state, "sync committed");
                outcome.committed.push(id);
            }
            Err(e) => {
                warn!(%id, error = %e, "sync commit refused");
                self.abort(workload, view, outcome).await;
            }
        }
    }

    /// A failed messaging phase. Dead workloads are finished right away.
    async fn mark_failed(&self, m: &mut Member, view: ViewToken, outcome: &mut SyncOutcome) {
        if self.liveness.is_alive(m.workload.id().pid) {
            m.status = Status::Failed;
        } else {
            self.finish_dead(&m.workload, view, outcome).await;
            m.status = Status::Done;
        }
    }

    /// Give the workload back its pre-round state and reservation.
    async fn abort(&self, workload: &Workload, view: ViewToken, outcome: &mut SyncOutcome) {
        let id = workload.id();
        let exiting = workload.sync_state() == SyncState::Disabled;
        if !exiting && !self.liveness.is_alive(id.pid) {
            self.finish_dead(workload, view, outcome).await;
            return;
        }
        if let Err(e) = self.registry.sync_abort(workload) {
            warn!(%id, error = %e, "sync abort refused");
        }
        self.revert_view(workload, view, outcome, true);
    }

    /// Put the committed reservation of `workload` back into `view`.
    fn revert_view(
        &self,
        workload: &Workload,
        view: ViewToken,
        outcome: &mut SyncOutcome,
        aborted: bool,
    ) {
        let id = workload.id();
        match self.accounter.revert_to_committed(id, view) {
            Ok(()) => {
                if aborted {
                    outcome.aborted.push(id);
                }
            }
            Err(e) => {
                warn!(%id, error = %e, "committed reservation no longer fits, forcing ready");
                if let Err(e) = self.accounter.release(id, view) {
                    warn!(%id, error = %e, "release failed");
                }
                let forced = {
                    let g = workload.lock();
                    g.state() == State::Ready
                };
                if !forced {
                    if let Err(e) = self.registry.set_state(workload, State::Ready, SyncState::SyncNone) {
                        warn!(%id, error = %e, "could not force workload ready");
                    }
                }
                outcome.forced_ready.push(id);
            }
        }
    }

    async fn finish_dead(&self, workload: &Workload, view: ViewToken, outcome: &mut SyncOutcome) {
        let id = workload.id();
        info!(%id, "workload gone, finishing");
        if let Err(e) = self.accounter.release(id, view) {
            warn!(%id, error = %e, "release failed");
        }
        if let Err(e) = self.registry.finish(workload) {
            warn!(%id, error = %e, "finish refused");
        }
        if let Err(e) = self.platform.release(id).await {
            debug!(%id, error = %e, "platform release failed");
        }
        outcome.finished.push(id);
    }

    // ── Round end ──────────────────────────────────────────────

    async fn finalize(&self, view: ViewToken, outcome: &mut SyncOutcome) -> SyncResult<()> {
        let all_aborted = outcome.committed.is_empty()
            && outcome.finished.is_empty()
            && outcome.forced_ready.is_empty();
        if all_aborted {
            self.accounter.discard(view)?;
            info!(%view, "every workload aborted, view discarded");
            return Ok(());
        }

        self.accounter.adopt(view)?;
        outcome.adopted = true;
        let reaped = self.registry.reap_finished();
        if !reaped.is_empty() {
            debug!(reaped = reaped.len(), "finished workloads removed");
        }
        for (path, setting) in self.accounter.take_power_settings() {
            if let Err(e) = self.platform.actuate_power(&path, &setting).await {
                warn!(%path, error = %e, "power actuation failed");
            }
        }
        Ok(())
    }

    fn rollback(&self, snapshots: &[(Arc<Workload>, Schedule)], view: ViewToken) -> SyncResult<()> {
        for (workload, snapshot) in snapshots {
            self.registry.rollback(workload, snapshot.clone())?;
            if snapshot.state == State::Sync {
                self.registry.sync_abort(workload)?;
            }
        }
        self.accounter.discard(view)?;
        Ok(())
    }

    fn sync_deadline(&self) -> Duration {
        let estimated = self.policy.estimated_latency().mul_f64(self.config.safety_factor);
        estimated.max(self.config.min_phase_timeout())
    }
}

/// Call `f` under `limit`, trying again up to `retries` times.
async fn call_with_retry<T, F, Fut>(
    limit: Duration,
    retries: u32,
    mut f: F,
) -> Result<T, PhaseFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut last = PhaseFailure::Timeout;
    for _ in 0..=retries {
        match tokio::time::timeout(limit, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last = PhaseFailure::Rpc(e),
            Err(_) => last = PhaseFailure::Timeout,
        }
    }
    Err(last)
}
