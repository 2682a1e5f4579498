//! bbque-sched: deciding who runs where.
//!
//! # Architecture
//!
//! ```text
//! notify_event(OPTS | PLAT | USR1) ──► EventQueue (dirty mask + Notify)
//!                                          │
//! SchedulerManager::run ◄──────────────────┘
//!   └── schedule()
//!         ├── open candidate view
//!         ├── SchedulerPolicy::schedule(SystemView, view)
//!         ├── classify proposals (SYNC / continue)
//!         ├── SyncPolicy::plan(candidates)
//!         └── SynchronizationManager::commit(plan, view)
//! ```

use std::sync::Arc;

use bbque_sync::{SasbPolicy, SyncPolicy};

pub mod driver;
pub mod error;
pub mod events;
pub mod policy;
pub mod priority_fit;

pub use driver::{RoundOutcome, SchedulerManager};
pub use error::{PolicyError, SchedError, SchedResult};
pub use events::{EventKind, EventMask, EventQueue};
pub use policy::{SchedulerPolicy, SystemView};
pub use priority_fit::PriorityFitPolicy;

/// Scheduling policy by configured name.
pub fn scheduler_policy(name: &str) -> SchedResult<Arc<dyn SchedulerPolicy>> {
    match name {
        "priority-fit" => Ok(Arc::new(PriorityFitPolicy::new())),
        other => Err(SchedError::UnknownPolicy(other.to_string())),
    }
}

/// Synchronization policy by configured name.
pub fn sync_policy(name: &str) -> SchedResult<Arc<dyn SyncPolicy>> {
    match name {
        "sasb" => Ok(Arc::new(SasbPolicy::new())),
        other => Err(SchedError::UnknownPolicy(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_by_name() {
        assert_eq!(scheduler_policy("priority-fit").unwrap().name(), "priority-fit");
        assert_eq!(sync_policy("sasb").unwrap().name(), "sasb");
        assert!(matches!(
            scheduler_policy("yamca"),
            Err(SchedError::UnknownPolicy(name)) if name == "yamca"
        ));
    }
}
