//! Reference policy: priority-ordered greedy fit.
//!
//! Every schedulable workload gives back what it holds in the candidate
//! view; workloads are then placed again most important first, each in
//! the highest-value working mode that fits. Leaves are ranked so that a
//! workload stays where it already runs, then high-performance and
//! healthy processing elements are preferred, then the ones with the most
//! room left.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use bbque_app::{State, WorkingMode, Workload};
use bbque_core::ResourcePath;
use bbque_res::{ResourceBinding, ViewToken};

use crate::error::PolicyError;
use crate::policy::{SchedulerPolicy, SystemView};

#[derive(Debug, Default)]
pub struct PriorityFitPolicy;

impl PriorityFitPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl SchedulerPolicy for PriorityFitPolicy {
    fn name(&self) -> &str {
        "priority-fit"
    }

    fn schedule(&self, system: &SystemView<'_>, view: ViewToken) -> Result<ViewToken, PolicyError> {
        let mut workloads: Vec<Arc<Workload>> = system
            .running()
            .chain(system.thawed())
            .chain(system.ready())
            .chain(system.restoring())
            .collect();
        workloads.sort_by_key(|w| (w.priority(), w.id()));

        for w in &workloads {
            system
                .release(w.id(), view)
                .map_err(|e| PolicyError::Failed(e.to_string()))?;
        }

        let mut placed = 0usize;
        let mut blocked = 0usize;
        for w in &workloads {
            if place(system, w, view) {
                placed += 1;
                continue;
            }
            match w.state() {
                State::Running | State::Thawed => {
                    system
                        .block(w, view)
                        .map_err(|e| PolicyError::Failed(e.to_string()))?;
                    blocked += 1;
                }
                state => debug!(id = %w.id(), %state, "no working mode fits"),
            }
        }

        info!(
            policy = self.name(),
            candidates = workloads.len(),
            placed,
            blocked,
            "schedule computed"
        );
        if placed == 0 && blocked == 0 && !workloads.is_empty() {
            return Err(PolicyError::NoResources);
        }
        Ok(view)
    }
}

/// Try the working modes of `w` by decreasing value.
fn place(system: &SystemView<'_>, w: &Workload, view: ViewToken) -> bool {
    let held: BTreeSet<ResourcePath> = w
        .current()
        .map(|a| a.binding.paths().into_iter().cloned().collect())
        .unwrap_or_default();

    let mut modes = w.working_modes();
    modes.sort_by(|a, b| b.value.cmp(&a.value).then(a.id.cmp(&b.id)));

    for mode in modes {
        let Some(binding) = fit(system, &mode, &held, view) else {
            continue;
        };
        match system.assign(w, Arc::clone(&mode), binding, view) {
            Ok(()) => return true,
            Err(e) => debug!(id = %w.id(), mode = %mode.name, error = %e, "booking refused"),
        }
    }
    false
}

/// Greedy binding of every request of `mode` onto free leaves.
fn fit(
    system: &SystemView<'_>,
    mode: &WorkingMode,
    held: &BTreeSet<ResourcePath>,
    view: ViewToken,
) -> Option<ResourceBinding> {
    let mut binding = ResourceBinding::new();
    for request in &mode.requests {
        let mut ranked: Vec<Candidate> = system
            .leaves(&request.path)
            .into_iter()
            .filter_map(|r| {
                let free = system
                    .available(&r.path, view)
                    .ok()?
                    .saturating_sub(binding.amount(&r.path));
                (free > 0).then(|| Candidate {
                    held: held.contains(&r.path),
                    high_performance: system.is_high_performance(&r.path),
                    degradation: r.degradation(),
                    free,
                    path: r.path,
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.held
                .cmp(&a.held)
                .then(b.high_performance.cmp(&a.high_performance))
                .then(a.degradation.cmp(&b.degradation))
                .then(b.free.cmp(&a.free))
                .then(a.path.cmp(&b.path))
        });

        let mut left = request.amount;
        for c in ranked {
            if left == 0 {
                break;
            }
            let take = c.free.min(left);
            binding.bind(c.path, take);
            left -= take;
        }
        if left > 0 {
            return None;
        }
    }
    (!binding.is_empty()).then_some(binding)
}

struct Candidate {
    held: bool,
    high_performance: bool,
    degradation: u8,
    free: u64,
    path: ResourcePath,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use bbque_app::{Recipe, SyncState, WorkloadKind, WorkloadRegistry};
    use bbque_core::WorkloadId;
    use bbque_res::ResourceAccounter;

    use super::*;

    fn make_accounter(pes: u32) -> ResourceAccounter {
        let accounter = ResourceAccounter::new(4);
        for pe in 0..pes {
            accounter
                .register_resource(&format!("sys0.cpu0.pe{pe}"), None, 100)
                .unwrap();
        }
        accounter.register_resource("sys0.mem0", None, 1024).unwrap();
        accounter
    }

    fn recipe() -> Arc<Recipe> {
        let pe: ResourcePath = "sys.cpu.pe".parse().unwrap();
        let mem: ResourcePath = "sys.mem".parse().unwrap();
        Arc::new(
            Recipe::new(
                "test",
                vec![
                    WorkingMode::new(0, "small", 2)
                        .with_request(pe.clone(), 100)
                        .with_request(mem.clone(), 128),
                    WorkingMode::new(1, "large", 8)
                        .with_request(pe, 200)
                        .with_request(mem, 256),
                ],
            )
            .unwrap(),
        )
    }

    fn add(registry: &WorkloadRegistry, pid: u32, priority: u8) -> Arc<Workload> {
        let id = WorkloadId::new(pid);
        let w = registry
            .register(id, &format!("w{pid}"), WorkloadKind::Adaptive(recipe()), priority)
            .unwrap();
        registry.notify_start(id).unwrap();
        w
    }

    fn pe(n: u32) -> ResourcePath {
        format!("sys0.cpu0.pe{n}").parse().unwrap()
    }

    #[test]
    fn highest_value_mode_first() {
        let registry = WorkloadRegistry::new();
        let accounter = make_accounter(4);
        let refs = AtomicU64::new(0);
        let w = add(&registry, 1, 0);
        let view = accounter.open_view("t").unwrap();

        let system = SystemView::new(&registry, &accounter, &refs);
        PriorityFitPolicy::new().schedule(&system, view).unwrap();

        let next = w.next().unwrap();
        assert_eq!(next.mode.name, "large");
        assert_eq!(next.binding.total(&"sys.cpu.pe".parse().unwrap()), 200);
        assert_eq!(accounter.used(&"sys0".parse().unwrap(), view).unwrap(), 456);
        assert_eq!(next.binding_ref, 1);
    }

    #[test]
    fn priority_decides_who_gets_the_large_mode() {
        let registry = WorkloadRegistry::new();
        let accounter = make_accounter(3);
        let refs = AtomicU64::new(0);
        let low = add(&registry, 1, 5);
        let high = add(&registry, 2, 0);
        let view = accounter.open_view("t").unwrap();

        let system = SystemView::new(&registry, &accounter, &refs);
        PriorityFitPolicy::new().schedule(&system, view).unwrap();

        assert_eq!(high.next().unwrap().mode.name, "large");
        assert_eq!(low.next().unwrap().mode.name, "small");
    }

    #[test]
    fn high_performance_pes_preferred() {
        let registry = WorkloadRegistry::new();
        let accounter = make_accounter(4);
        accounter.set_high_performance(&pe(3), true).unwrap();
        let refs = AtomicU64::new(0);
        let w = registry
            .register(
                WorkloadId::new(1),
                "w",
                WorkloadKind::Adaptive(Arc::new(
                    Recipe::new(
                        "one",
                        vec![WorkingMode::new(0, "one", 1).with_request("sys.cpu.pe".parse().unwrap(), 100)],
                    )
                    .unwrap(),
                )),
                0,
            )
            .unwrap();
        registry.notify_start(w.id()).unwrap();
        let view = accounter.open_view("t").unwrap();

        let system = SystemView::new(&registry, &accounter, &refs);
        PriorityFitPolicy::new().schedule(&system, view).unwrap();
        assert_eq!(w.next().unwrap().binding.amount(&pe(3)), 100);
    }

    #[test]
    fn running_workload_that_no_longer_fits_is_blocked() {
        let registry = WorkloadRegistry::new();
        let accounter = make_accounter(2);
        let refs = AtomicU64::new(0);
        let w = add(&registry, 1, 0);

        // Put it in RUNNING with a committed reservation on both PEs.
        let view = accounter.open_view("first").unwrap();
        let system = SystemView::new(&registry, &accounter, &refs);
        PriorityFitPolicy::new().schedule(&system, view).unwrap();
        registry
            .update(&w, |g| {
                let sync = g.next_sync_state();
                g.set_state(State::Sync, sync)?;
                g.sync_commit().map(|_| ())
            })
            .unwrap();
        accounter.adopt(view).unwrap();

        accounter.set_offline(&pe(0), 100).unwrap();
        accounter.set_offline(&pe(1), 100).unwrap();
        let view = accounter.open_view("second").unwrap();
        PriorityFitPolicy::new().schedule(&system, view).unwrap();

        assert!(w.lock().block_requested());
        assert!(w.next().is_none());
        assert_eq!(accounter.used_by(w.id(), &"sys0".parse().unwrap(), view).unwrap(), 0);
        assert_eq!(w.sync_state(), SyncState::SyncNone);
    }

    #[test]
    fn running_workload_keeps_its_pes() {
        let registry = WorkloadRegistry::new();
        let accounter = make_accounter(4);
        let refs = AtomicU64::new(0);
        let w = add(&registry, 1, 0);
        let system = SystemView::new(&registry, &accounter, &refs);

        let view = accounter.open_view("first").unwrap();
        PriorityFitPolicy::new().schedule(&system, view).unwrap();
        let first = w.next().unwrap().binding;
        registry
            .update(&w, |g| {
                let sync = g.next_sync_state();
                g.set_state(State::Sync, sync)?;
                g.sync_commit().map(|_| ())
            })
            .unwrap();
        accounter.adopt(view).unwrap();

        let view = accounter.open_view("second").unwrap();
        PriorityFitPolicy::new().schedule(&system, view).unwrap();
        let mut g = w.lock();
        assert_eq!(g.next().unwrap().binding, first);
        assert_eq!(g.next_sync_state(), SyncState::SyncNone);
        g.clear_next();
    }

    #[test]
    fn nothing_fits_is_no_resources() {
        let registry = WorkloadRegistry::new();
        let accounter = make_accounter(1);
        accounter.set_offline(&pe(0), 100).unwrap();
        let refs = AtomicU64::new(0);
        add(&registry, 1, 0);
        let view = accounter.open_view("t").unwrap();

        let system = SystemView::new(&registry, &accounter, &refs);
        assert_eq!(
            PriorityFitPolicy::new().schedule(&system, view),
            Err(PolicyError::NoResources)
        );
    }
}
