//! Starvation-avoidance state-based (SASB) synchronization ordering.
//!
//! Workloads giving resources back go first, so that the ones acquiring
//! resources later in the round find them free:
//!
//! ```text
//! step 1  DISABLED, BLOCKED                      (release)
//! step 2  MIGRATED, R-MIGRATED, RECONFIG         (value down or same)
//! step 3  MIGRATED, R-MIGRATED, RECONFIG         (value goes up)
//! step 4  STARTING                               (acquire)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use bbque_app::SyncState;
use bbque_core::{Priority, WorkloadId};

/// A workload entering the synchronization of this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCandidate {
    pub id: WorkloadId,
    pub sync_state: SyncState,
    pub priority: Priority,
    /// Value of the current working mode, if any.
    pub prev_value: Option<u32>,
    /// Value of the proposed working mode, if any.
    pub next_value: Option<u32>,
}

impl SyncCandidate {
    fn value(&self) -> u32 {
        self.next_value.or(self.prev_value).unwrap_or(0)
    }

    fn raises_value(&self) -> bool {
        match (self.prev_value, self.next_value) {
            (Some(prev), Some(next)) => next > prev,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// Workloads synchronized together, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cohort {
    pub step: u8,
    pub sync_state: SyncState,
    pub members: Vec<WorkloadId>,
}

/// Ordered cohorts of one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub cohorts: Vec<Cohort>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty()
    }

    /// Every planned workload, in plan order.
    pub fn workloads(&self) -> impl Iterator<Item = WorkloadId> + '_ {
        self.cohorts.iter().flat_map(|c| c.members.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.cohorts.iter().map(|c| c.members.len()).sum()
    }
}

/// Orders the workloads of a round into cohorts.
pub trait SyncPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Partition `candidates` into ordered cohorts. Resets the latency
    /// estimate.
    fn plan(&self, candidates: &[SyncCandidate]) -> SyncPlan;

    /// Record the latency a workload declared in PreChange.
    fn check_latency(&self, id: WorkloadId, latency: Duration);

    /// Largest latency declared since the last plan.
    fn estimated_latency(&self) -> Duration;
}

#[derive(Debug, Default)]
pub struct SasbPolicy {
    max_latency_us: AtomicU64,
}

impl SasbPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

const STEPS: [(u8, &[SyncState]); 4] = [
    (1, &[SyncState::Disabled, SyncState::Blocked]),
    (
        2,
        &[SyncState::Migrate, SyncState::MigRec, SyncState::Reconf],
    ),
    (
        3,
        &[SyncState::Migrate, SyncState::MigRec, SyncState::Reconf],
    ),
    (4, &[SyncState::Starting]),
];

impl SyncPolicy for SasbPolicy {
    fn name(&self) -> &str {
        "sasb"
    }

    fn plan(&self, candidates: &[SyncCandidate]) -> SyncPlan {
        self.max_latency_us.store(0, Ordering::Relaxed);

        let mut cohorts = Vec::new();
        for (step, states) in STEPS {
            for &state in states {
                let mut members: Vec<&SyncCandidate> = candidates
                    .iter()
                    .filter(|c| c.sync_state == state)
                    .filter(|c| match step {
                        2 => !c.raises_value(),
                        3 => c.raises_value(),
                        _ => true,
                    })
                    .collect();
                if members.is_empty() {
                    continue;
                }
                members.sort_by_key(|c| (c.value(), c.priority, c.id));
                cohorts.push(Cohort {
                    step,
                    sync_state: state,
                    members: members.into_iter().map(|c| c.id).collect(),
                });
            }
        }

        let plan = SyncPlan { cohorts };
        debug!(cohorts = plan.cohorts.len(), workloads = plan.len(), "sync plan");
        plan
    }

    fn check_latency(&self, id: WorkloadId, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let prev = self.max_latency_us.fetch_max(us, Ordering::Relaxed);
        if us > prev {
            debug!(%id, latency_ms = latency.as_millis() as u64, "new max sync latency");
        }
    }

    fn estimated_latency(&self) -> Duration {
        Duration::from_micros(self.max_latency_us.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn candidate(pid: u32, sync_state: SyncState, prev: Option<u32>, next: Option<u32>) -> SyncCandidate {
        SyncCandidate {
            id: WorkloadId::new(pid),
            sync_state,
            priority: 1,
            prev_value: prev,
            next_value: next,
        }
    }

    fn shape(plan: &SyncPlan) -> Vec<(u8, SyncState, Vec<u32>)> {
        plan.cohorts
            .iter()
            .map(|c| (c.step, c.sync_state, c.members.iter().map(|id| id.pid).collect()))
            .collect()
    }

    #[test]
    fn releases_before_acquisitions() {
        let plan = SasbPolicy::new().plan(&[
            candidate(1, SyncState::Starting, None, Some(5)),
            candidate(2, SyncState::Reconf, Some(9), Some(3)),
            candidate(3, SyncState::Blocked, Some(4), None),
            candidate(4, SyncState::Migrate, Some(2), Some(2)),
            candidate(5, SyncState::Disabled, Some(1), None),
        ]);
        assert_eq!(
            shape(&plan),
            vec![
                (1, SyncState::Disabled, vec![5]),
                (1, SyncState::Blocked, vec![3]),
                (2, SyncState::Migrate, vec![4]),
                (2, SyncState::Reconf, vec![2]),
                (4, SyncState::Starting, vec![1]),
            ]
        );
    }

    #[test]
    fn equal_value_moves_release_before_raises() {
        let plan = SasbPolicy::new().plan(&[
            candidate(1, SyncState::Migrate, Some(10), Some(10)),
            candidate(2, SyncState::Migrate, Some(10), Some(10)),
            candidate(3, SyncState::Reconf, Some(10), Some(8)),
            candidate(4, SyncState::Reconf, Some(5), Some(12)),
        ]);
        assert_eq!(
            shape(&plan),
            vec![
                (2, SyncState::Migrate, vec![1, 2]),
                (2, SyncState::Reconf, vec![3]),
                (3, SyncState::Reconf, vec![4]),
            ]
        );
    }

    #[test]
    fn cohort_order_value_then_priority_then_id() {
        let mut a = candidate(10, SyncState::Starting, None, Some(5));
        let mut b = candidate(11, SyncState::Starting, None, Some(5));
        let c = candidate(12, SyncState::Starting, None, Some(1));
        let d = candidate(9, SyncState::Starting, None, Some(5));
        a.priority = 0;
        b.priority = 0;
        let plan = SasbPolicy::new().plan(&[a, b, c, d]);
        assert_eq!(shape(&plan), vec![(4, SyncState::Starting, vec![12, 10, 11, 9])]);
    }

    #[test]
    fn every_candidate_planned_exactly_once() {
        let states = [
            SyncState::Starting,
            SyncState::Reconf,
            SyncState::MigRec,
            SyncState::Migrate,
            SyncState::Blocked,
            SyncState::Disabled,
        ];
        let candidates: Vec<SyncCandidate> = (0..60u32)
            .map(|i| {
                let state = states[(i % 6) as usize];
                let prev = (state != SyncState::Starting).then_some(i % 7);
                let next = state.acquires_resources().then_some(i % 5);
                candidate(i, state, prev, next)
            })
            .collect();

        let plan = SasbPolicy::new().plan(&candidates);
        let planned: Vec<WorkloadId> = plan.workloads().collect();
        assert_eq!(planned.len(), candidates.len());
        let unique: BTreeSet<WorkloadId> = planned.iter().copied().collect();
        assert_eq!(unique.len(), candidates.len());
        assert!(plan.cohorts.iter().all(|c| !c.members.is_empty()));
        assert!(plan.cohorts.windows(2).all(|w| w[0].step <= w[1].step));
    }

    #[test]
    fn no_candidates_no_cohorts() {
        assert!(SasbPolicy::new().plan(&[]).is_empty());
    }

    #[test]
    fn latency_estimate_resets_on_plan() {
        let policy = SasbPolicy::new();
        policy.check_latency(WorkloadId::new(1), Duration::from_millis(20));
        policy.check_latency(WorkloadId::new(2), Duration::from_millis(80));
        policy.check_latency(WorkloadId::new(3), Duration::from_millis(40));
        assert_eq!(policy.estimated_latency(), Duration::from_millis(80));
        policy.plan(&[]);
        assert_eq!(policy.estimated_latency(), Duration::ZERO);
    }
}
