//! Platform proxy: the layer that enforces assignments on the machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use bbque_core::{ResourcePath, WorkloadId};
use bbque_res::{PowerSetting, ResourceAccounter, ResourceBinding};

use crate::error::{PlatformError, SyncResult};

/// A resource discovered on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResource {
    pub path: String,
    pub capacity: u64,
    pub model: Option<String>,
    pub high_performance: bool,
}

/// Enforcement back-end: resource partitioning, power, and the
/// freeze/checkpoint facilities of the OS.
#[async_trait]
pub trait PlatformProxy: Send + Sync {
    /// Describe every resource the platform exposes.
    async fn enumerate(&self) -> Result<Vec<PlatformResource>, PlatformError>;

    async fn is_high_performance(&self, path: &ResourcePath) -> bool;

    /// Enforce `binding` for a workload about to run with it.
    async fn map_resources(
        &self,
        id: WorkloadId,
        binding: &ResourceBinding,
    ) -> Result<(), PlatformError>;

    /// Take back the resources of a blocked workload. It stays alive.
    async fn reclaim(&self, id: WorkloadId) -> Result<(), PlatformError>;

    /// Drop the platform state of a workload that is gone.
    async fn release(&self, id: WorkloadId) -> Result<(), PlatformError>;

    async fn actuate_power(
        &self,
        path: &ResourcePath,
        setting: &PowerSetting,
    ) -> Result<(), PlatformError>;

    async fn freeze(&self, id: WorkloadId) -> Result<(), PlatformError>;

    async fn thaw(&self, id: WorkloadId) -> Result<(), PlatformError>;

    async fn checkpoint(&self, id: WorkloadId) -> Result<(), PlatformError>;

    async fn restore(&self, id: WorkloadId) -> Result<(), PlatformError>;
}

/// Load the platform description into the accounter.
///
/// Returns the number of resources registered.
pub async fn populate(
    platform: &dyn PlatformProxy,
    accounter: &ResourceAccounter,
) -> SyncResult<usize> {
    let resources = platform.enumerate().await?;
    let mut registered = 0;
    for r in &resources {
        let path = match accounter.register_resource(&r.path, r.model.as_deref(), r.capacity) {
            Ok(path) => path,
            Err(e) => {
                warn!(path = %r.path, error = %e, "resource skipped");
                continue;
            }
        };
        let high = r.high_performance || platform.is_high_performance(&path).await;
        if high {
            accounter.set_high_performance(&path, true)?;
        }
        registered += 1;
    }
    info!(resources = registered, "platform resources loaded");
    Ok(registered)
}
