//! bbqued: the bbque scheduling daemon.
//!
//! # Components
//!
//! - [`daemon`] builds every subsystem from `bbque.toml` and spawns the
//!   scheduler, metrics and checkpoint tasks
//! - [`commands`] serves the line-oriented command channel
//! - [`reliability`] freezes, checkpoints and restores workloads and
//!   handles resource faults
//! - [`simulation`] provides the in-memory platform and workload channel

pub mod commands;
pub mod daemon;
pub mod error;
pub mod reliability;
pub mod simulation;

pub use commands::{execute, serve, status};
pub use daemon::{ConfigSummary, Daemon, build_recipes, validate};
pub use error::{CommandError, CommandResult};
pub use reliability::ReliabilityManager;
pub use simulation::{LoopbackRpc, SimulatedPlatform};
