//! Metrics collector: counters of scheduling and synchronization.
//!
//! Counters are plain atomics; phase latency samples sit behind a mutex
//! and are summarized into percentiles when a snapshot is taken. Samples
//! cover the current logging window only, and at most `MAX_SAMPLES` of
//! them are kept per phase.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use bbque_app::SyncState;

/// Latency samples kept per phase; older ones are dropped first.
pub const MAX_SAMPLES: usize = 4096;

/// Phase of the synchronization protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    PreChange,
    SyncChange,
    DoChange,
    PostChange,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::PreChange,
        Phase::SyncChange,
        Phase::DoChange,
        Phase::PostChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreChange => "pre_change",
            Phase::SyncChange => "sync_change",
            Phase::DoChange => "do_change",
            Phase::PostChange => "post_change",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of the latency samples of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseTiming {
    pub samples: u64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub sched_runs: u64,
    pub sched_failed: u64,
    pub sched_empty: u64,
    pub rounds_aborted: u64,
    pub sync_runs: u64,
    pub sync_completed: u64,
    pub sync_failed: u64,
    pub sync_hit: u64,
    pub sync_miss: u64,
    /// Workloads that entered each sync-state.
    pub sync_states: BTreeMap<String, u64>,
    pub phases: BTreeMap<String, PhaseTiming>,
}

/// Collects counters for the whole daemon.
pub struct MetricsCollector {
    sched_runs: AtomicU64,
    sched_failed: AtomicU64,
    sched_empty: AtomicU64,
    rounds_aborted: AtomicU64,
    sync_runs: AtomicU64,
    sync_completed: AtomicU64,
    sync_failed: AtomicU64,
    sync_hit: AtomicU64,
    sync_miss: AtomicU64,
    sync_states: [AtomicU64; SyncState::ALL.len()],
    /// Latency samples (microseconds) per phase.
    latencies: Mutex<[VecDeque<u64>; Phase::ALL.len()]>,
    interval: Duration,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MetricsCollector {
    pub fn new(interval: Duration) -> Self {
        Self {
            sched_runs: AtomicU64::new(0),
            sched_failed: AtomicU64::new(0),
            sched_empty: AtomicU64::new(0),
            rounds_aborted: AtomicU64::new(0),
            sync_runs: AtomicU64::new(0),
            sync_completed: AtomicU64::new(0),
            sync_failed: AtomicU64::new(0),
            sync_hit: AtomicU64::new(0),
            sync_miss: AtomicU64::new(0),
            sync_states: Default::default(),
            latencies: Mutex::new(Default::default()),
            interval,
        }
    }

    // ── Scheduler ──────────────────────────────────────────────

    pub fn record_sched_run(&self) {
        self.sched_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sched_failed(&self) {
        self.sched_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A round found nothing to schedule.
    pub fn record_sched_empty(&self) {
        self.sched_empty.fetch_add(1, Ordering::Relaxed);
    }

    // ── Synchronization ────────────────────────────────────────

    pub fn record_sync_start(&self) {
        self.sync_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Outcome of a synchronization round.
    ///
    /// `committed` and `aborted` count workloads; a round with no committed
    /// workload is an aborted round.
    pub fn record_sync_end(&self, committed: u64, aborted: u64) {
        self.sync_hit.fetch_add(committed, Ordering::Relaxed);
        self.sync_miss.fetch_add(aborted, Ordering::Relaxed);
        if committed == 0 && aborted > 0 {
            self.sync_failed.fetch_add(1, Ordering::Relaxed);
            self.rounds_aborted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sync_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A whole round was rolled back.
    pub fn record_round_aborted(&self) {
        self.sync_failed.fetch_add(1, Ordering::Relaxed);
        self.rounds_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_state(&self, state: SyncState) {
        if let Some(i) = SyncState::ALL.iter().position(|s| *s == state) {
            self.sync_states[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn record_phase(&self, phase: Phase, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut latencies = self.latencies.lock().await;
        let samples = &mut latencies[phase.index()];
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    /// Start a new latency window.
    async fn reset_latencies(&self) {
        for samples in self.latencies.lock().await.iter_mut() {
            samples.clear();
        }
    }

    // ── Reading ────────────────────────────────────────────────

    pub fn sched_runs(&self) -> u64 {
        self.sched_runs.load(Ordering::Relaxed)
    }

    pub fn rounds_aborted(&self) -> u64 {
        self.rounds_aborted.load(Ordering::Relaxed)
    }

    pub fn sync_state_count(&self, state: SyncState) -> u64 {
        SyncState::ALL
            .iter()
            .position(|s| *s == state)
            .map_or(0, |i| self.sync_states[i].load(Ordering::Relaxed))
    }

    /// Copy every counter and summarize the current latency window.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let latencies = self.latencies.lock().await;
        let phases = Phase::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), compute_timing(&latencies[p.index()])))
            .collect();
        drop(latencies);

        let sync_states = SyncState::ALL
            .iter()
            .zip(&self.sync_states)
            .map(|(s, c)| (s.as_str().to_string(), c.load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            sched_runs: self.sched_runs.load(Ordering::Relaxed),
            sched_failed: self.sched_failed.load(Ordering::Relaxed),
            sched_empty: self.sched_empty.load(Ordering::Relaxed),
            rounds_aborted: self.rounds_aborted.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
            sync_completed: self.sync_completed.load(Ordering::Relaxed),
            sync_failed: self.sync_failed.load(Ordering::Relaxed),
            sync_hit: self.sync_hit.load(Ordering::Relaxed),
            sync_miss: self.sync_miss.load(Ordering::Relaxed),
            sync_states,
            phases,
        }
    }

    /// Log a snapshot every interval until shutdown.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "metrics collector started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let s = self.snapshot().await;
                    info!(
                        sched_runs = s.sched_runs,
                        sched_failed = s.sched_failed,
                        sync_hit = s.sync_hit,
                        sync_miss = s.sync_miss,
                        rounds_aborted = s.rounds_aborted,
                        sync_p99_ms = s.phases.get("sync_change").map_or(0.0, |t| t.p99_ms),
                        "metrics"
                    );
                    self.reset_latencies().await;
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}

/// Percentiles of a set of microsecond samples, in milliseconds.
fn compute_timing(samples: &VecDeque<u64>) -> PhaseTiming {
    if samples.is_empty() {
        return PhaseTiming::default();
    }

    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();

    let at = |q: f64| {
        let idx = (sorted.len() as f64 * q) as usize;
        sorted[idx.min(sorted.len() - 1)] as f64 / 1000.0
    };

    PhaseTiming {
        samples: sorted.len() as u64,
        p50_ms: at(0.50),
        p99_ms: at(0.99),
        max_ms: sorted[sorted.len() - 1] as f64 / 1000.0,
    }
}
