//! bbque-sync: turning a scheduling decision into running reality.
//!
//! A round's candidate view is committed by walking the workloads through
//! the synchronization protocol in the order chosen by a [`SyncPolicy`],
//! enforcing each assignment through a [`PlatformProxy`], and finally
//! adopting (or discarding) the view.
//!
//! # Architecture
//!
//! ```text
//! SynchronizationManager::commit(plan, view)
//!   ├── SyncPolicy (SASB) ─── cohort order, latency estimate
//!   ├── WorkloadRpc ───────── PreChange / SyncChange / DoChange / PostChange
//!   ├── PlatformProxy ─────── map / reclaim / release / power / freeze
//!   ├── ProcessLiveness ───── signal-0 check
//!   └── ResourceAccounter ─── adopt / discard / revert_to_committed
//! ```

pub mod error;
pub mod liveness;
pub mod manager;
pub mod platform;
pub mod rpc;
pub mod sasb;

pub use error::{PlatformError, RpcError, SyncError, SyncResult};
pub use liveness::{AssumeAlive, ProcessLiveness, SignalLiveness};
pub use manager::{SyncOutcome, SynchronizationManager};
pub use platform::{PlatformProxy, PlatformResource, populate};
pub use rpc::{ChangeSummary, PostReply, SyncReply, WorkloadRpc};
pub use sasb::{Cohort, SasbPolicy, SyncCandidate, SyncPlan, SyncPolicy};
