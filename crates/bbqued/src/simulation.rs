//! In-process platform and workload channel.
//!
//! The daemon runs against a simulated machine described by the
//! `[[resources]]` tables of the configuration. Managed applications are
//! simulated as well: they answer every protocol message after the
//! configured latency. Both sides accept injected faults so the recovery
//! paths can be exercised from the command line and from tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use bbque_core::config::ResourceConfig;
use bbque_core::{ResourcePath, WorkloadId};
use bbque_res::{PowerSetting, ResourceBinding};
use bbque_sync::{
    ChangeSummary, PlatformError, PlatformProxy, PlatformResource, PostReply, RpcError, SyncReply,
    WorkloadRpc,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Platform ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MachineState {
    mapped: BTreeMap<WorkloadId, ResourceBinding>,
    frozen: BTreeSet<WorkloadId>,
    images: BTreeSet<WorkloadId>,
    power: BTreeMap<ResourcePath, PowerSetting>,
    failing_maps: BTreeSet<WorkloadId>,
    crash_next_map: bool,
}

/// Platform proxy over a machine that exists only in memory.
#[derive(Debug)]
pub struct SimulatedPlatform {
    resources: Vec<PlatformResource>,
    state: Mutex<MachineState>,
}

impl SimulatedPlatform {
    pub fn new(resources: &[ResourceConfig]) -> Self {
        Self {
            resources: resources
                .iter()
                .map(|r| PlatformResource {
                    path: r.path.clone(),
                    capacity: r.capacity,
                    model: r.model.clone(),
                    high_performance: r.high_performance,
                })
                .collect(),
            state: Mutex::new(MachineState::default()),
        }
    }

    /// Make every later mapping of `id` fail.
    pub fn fail_mapping(&self, id: WorkloadId) {
        lock(&self.state).failing_maps.insert(id);
    }

    pub fn heal_mapping(&self, id: WorkloadId) {
        lock(&self.state).failing_maps.remove(&id);
    }

    /// Make the next mapping request crash the platform layer.
    pub fn crash_next_map(&self) {
        lock(&self.state).crash_next_map = true;
    }

    /// Binding currently enforced for a workload.
    pub fn mapped(&self, id: WorkloadId) -> Option<ResourceBinding> {
        lock(&self.state).mapped.get(&id).cloned()
    }

    pub fn is_frozen(&self, id: WorkloadId) -> bool {
        lock(&self.state).frozen.contains(&id)
    }

    pub fn has_image(&self, id: WorkloadId) -> bool {
        lock(&self.state).images.contains(&id)
    }

    pub fn power_setting(&self, path: &ResourcePath) -> Option<PowerSetting> {
        lock(&self.state).power.get(path).cloned()
    }
}

#[async_trait]
impl PlatformProxy for SimulatedPlatform {
    async fn enumerate(&self) -> Result<Vec<PlatformResource>, PlatformError> {
        if self.resources.is_empty() {
            return Err(PlatformError::InitFailed("no resources configured".into()));
        }
        Ok(self.resources.clone())
    }

    async fn is_high_performance(&self, path: &ResourcePath) -> bool {
        let path = path.to_string();
        self.resources
            .iter()
            .any(|r| r.path == path && r.high_performance)
    }

    async fn map_resources(
        &self,
        id: WorkloadId,
        binding: &ResourceBinding,
    ) -> Result<(), PlatformError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.crash_next_map) {
            warn!(%id, "simulated platform crash");
            return Err(PlatformError::Crashed("simulated crash".into()));
        }
        if state.failing_maps.contains(&id) {
            return Err(PlatformError::MappingFailed {
                id,
                reason: "simulated mapping failure".into(),
            });
        }
        debug!(%id, entries = binding.len(), "resources mapped");
        state.mapped.insert(id, binding.clone());
        Ok(())
    }

    async fn reclaim(&self, id: WorkloadId) -> Result<(), PlatformError> {
        lock(&self.state).mapped.remove(&id);
        debug!(%id, "resources reclaimed");
        Ok(())
    }

    async fn release(&self, id: WorkloadId) -> Result<(), PlatformError> {
        let mut state = lock(&self.state);
        state.mapped.remove(&id);
        state.frozen.remove(&id);
        debug!(%id, "platform state released");
        Ok(())
    }

    async fn actuate_power(
        &self,
        path: &ResourcePath,
        setting: &PowerSetting,
    ) -> Result<(), PlatformError> {
        info!(%path, online = setting.online, "power setting applied");
        lock(&self.state).power.insert(path.clone(), setting.clone());
        Ok(())
    }

    async fn freeze(&self, id: WorkloadId) -> Result<(), PlatformError> {
        lock(&self.state).frozen.insert(id);
        Ok(())
    }

    async fn thaw(&self, id: WorkloadId) -> Result<(), PlatformError> {
        lock(&self.state).frozen.remove(&id);
        Ok(())
    }

    async fn checkpoint(&self, id: WorkloadId) -> Result<(), PlatformError> {
        lock(&self.state).images.insert(id);
        debug!(%id, "checkpoint image written");
        Ok(())
    }

    async fn restore(&self, id: WorkloadId) -> Result<(), PlatformError> {
        if !lock(&self.state).images.contains(&id) {
            return Err(PlatformError::NotSupported("restore without a checkpoint image"));
        }
        debug!(%id, "restored from checkpoint image");
        Ok(())
    }
}

// ── Workload channel ───────────────────────────────────────────

#[derive(Debug, Default)]
struct Behavior {
    unreachable: BTreeSet<WorkloadId>,
    refusing: BTreeSet<WorkloadId>,
    post: BTreeMap<WorkloadId, PostReply>,
}

/// Workload channel answered in-process on behalf of the applications.
#[derive(Debug)]
pub struct LoopbackRpc {
    latency: Duration,
    behavior: Mutex<Behavior>,
    changes: Mutex<BTreeMap<WorkloadId, ChangeSummary>>,
}

impl LoopbackRpc {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            behavior: Mutex::new(Behavior::default()),
            changes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Stop answering for `id`.
    pub fn disconnect(&self, id: WorkloadId) {
        lock(&self.behavior).unreachable.insert(id);
    }

    /// Refuse SyncChange for `id`.
    pub fn refuse_sync(&self, id: WorkloadId) {
        lock(&self.behavior).refusing.insert(id);
    }

    /// Answer PostChange for `id` with `reply`.
    pub fn reply_post(&self, id: WorkloadId, reply: PostReply) {
        lock(&self.behavior).post.insert(id, reply);
    }

    /// Back to default answers for `id`.
    pub fn reset(&self, id: WorkloadId) {
        let mut behavior = lock(&self.behavior);
        behavior.unreachable.remove(&id);
        behavior.refusing.remove(&id);
        behavior.post.remove(&id);
    }

    /// Last change announced to `id`.
    pub fn last_change(&self, id: WorkloadId) -> Option<ChangeSummary> {
        lock(&self.changes).get(&id).cloned()
    }

    fn reachable(&self, id: WorkloadId) -> Result<(), RpcError> {
        if lock(&self.behavior).unreachable.contains(&id) {
            return Err(RpcError::Unreachable(id));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadRpc for LoopbackRpc {
    async fn pre_change(
        &self,
        round: u64,
        id: WorkloadId,
        change: ChangeSummary,
    ) -> Result<Duration, RpcError> {
        self.reachable(id)?;
        debug!(round, %id, sync_state = %change.sync_state, "pre-change");
        lock(&self.changes).insert(id, change);
        Ok(self.latency)
    }

    async fn sync_change(&self, round: u64, id: WorkloadId) -> Result<SyncReply, RpcError> {
        self.reachable(id)?;
        tokio::time::sleep(self.latency).await;
        if lock(&self.behavior).refusing.contains(&id) {
            debug!(round, %id, "sync point refused");
            return Ok(SyncReply::Refused);
        }
        Ok(SyncReply::Ok)
    }

    async fn do_change(&self, round: u64, id: WorkloadId) {
        debug!(round, %id, "do-change");
    }

    async fn post_change(&self, round: u64, id: WorkloadId) -> Result<PostReply, RpcError> {
        self.reachable(id)?;
        let reply = lock(&self.behavior)
            .post
            .get(&id)
            .copied()
            .unwrap_or(PostReply::Ok);
        debug!(round, %id, ?reply, "post-change");
        Ok(reply)
    }
}
