//! bbque-metrics: observability for scheduling rounds.
//!
//! Counts scheduler runs and their outcomes, synchronization hits and
//! misses per sync-state, and per-phase latencies of the synchronization
//! protocol. Exposes them as a serializable snapshot and in Prometheus
//! text format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record_*() ← called by the driver and the sync manager
//!   ├── snapshot() → MetricsSnapshot (counters + phase percentiles)
//!   └── run() → periodic log of the snapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{MetricsCollector, MetricsSnapshot, Phase, PhaseTiming};
pub use prometheus::render_prometheus;
