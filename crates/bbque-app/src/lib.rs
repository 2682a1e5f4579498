//! bbque-app: the workloads the resource manager schedules.
//!
//! Adaptive applications (with a recipe of working modes) and tracked OS
//! processes share one state machine and one registry. Policies and the
//! synchronization manager walk the registry through snapshot cursors.
//!
//! # Components
//!
//! - **`state`**: `State`/`SyncState` and next-sync classification
//! - **`working_mode`**: working modes, recipes, assignments
//! - **`workload`**: per-workload record and transitions
//! - **`registry`**: indexed store with priority-ordered cursors
//! - **`process`**: name-based tracking of unmodified processes

pub mod error;
pub mod process;
pub mod registry;
pub mod state;
pub mod working_mode;
pub mod workload;

pub use error::{AppError, AppResult};
pub use process::{PROCESS_PRIORITY, ProcessManager};
pub use registry::{StateCursor, WorkloadRegistry};
pub use state::{State, SyncState, classify_next_sync};
pub use working_mode::{Assignment, Recipe, ScheduleRequest, WorkingMode};
pub use workload::{Schedule, Workload, WorkloadGuard, WorkloadKind};
