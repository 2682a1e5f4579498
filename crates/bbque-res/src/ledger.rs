//! Reservation ledger held by each view.

use std::collections::BTreeMap;

use serde::Serialize;

use bbque_core::{ResourcePath, WorkloadId};

/// One (workload, resource, amount) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub workload: WorkloadId,
    pub path: ResourcePath,
    pub amount: u64,
}

/// Reservations of a single view, indexed by workload and by resource.
///
/// Views share a ledger through `Arc` until one of them writes; the
/// ledger itself is a plain value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    by_workload: BTreeMap<WorkloadId, BTreeMap<ResourcePath, u64>>,
    usage: BTreeMap<ResourcePath, u64>,
}

impl Ledger {
    pub fn used(&self, path: &ResourcePath) -> u64 {
        self.usage.get(path).copied().unwrap_or(0)
    }

    pub fn used_by(&self, workload: WorkloadId, path: &ResourcePath) -> u64 {
        self.by_workload
            .get(&workload)
            .and_then(|m| m.get(path))
            .copied()
            .unwrap_or(0)
    }

    /// Reservations of one workload in path order.
    pub fn holdings(&self, workload: WorkloadId) -> Option<&BTreeMap<ResourcePath, u64>> {
        self.by_workload.get(&workload)
    }

    /// Record `amount` for (workload, path), returning the amount it replaced.
    pub fn set(&mut self, workload: WorkloadId, path: &ResourcePath, amount: u64) -> u64 {
        let entries = self.by_workload.entry(workload).or_default();
        let previous = if amount == 0 {
            entries.remove(path).unwrap_or(0)
        } else {
            entries.insert(path.clone(), amount).unwrap_or(0)
        };
        if entries.is_empty() {
            self.by_workload.remove(&workload);
        }

        let usage = self.usage.entry(path.clone()).or_insert(0);
        *usage = *usage - previous + amount;
        if *usage == 0 {
            self.usage.remove(path);
        }
        previous
    }

    /// Drop every reservation of `workload`, returning what was removed.
    pub fn remove_workload(&mut self, workload: WorkloadId) -> BTreeMap<ResourcePath, u64> {
        let removed = self.by_workload.remove(&workload).unwrap_or_default();
        for (path, amount) in &removed {
            if let Some(usage) = self.usage.get_mut(path) {
                debug_assert!(*usage >= *amount, "usage of {path} below a reservation");
                *usage = usage.saturating_sub(*amount);
                if *usage == 0 {
                    self.usage.remove(path);
                }
            }
        }
        removed
    }

    pub fn workloads(&self) -> impl Iterator<Item = WorkloadId> + '_ {
        self.by_workload.keys().copied()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.by_workload
            .iter()
            .flat_map(|(w, entries)| {
                entries.iter().map(|(path, amount)| Reservation {
                    workload: *w,
                    path: path.clone(),
                    amount: *amount,
                })
            })
            .collect()
    }

    /// Resources that carry at least one reservation, with their usage.
    pub fn usage(&self) -> impl Iterator<Item = (&ResourcePath, u64)> {
        self.usage.iter().map(|(p, u)| (p, *u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ResourcePath {
        p.parse().unwrap()
    }

    #[test]
    fn set_replaces_and_tracks_usage() {
        let mut ledger = Ledger::default();
        let a = WorkloadId::new(1);
        let b = WorkloadId::new(2);
        let pe = path("sys0.cpu0.pe0");

        assert_eq!(ledger.set(a, &pe, 40), 0);
        ledger.set(b, &pe, 30);
        assert_eq!(ledger.used(&pe), 70);

        assert_eq!(ledger.set(a, &pe, 10), 40);
        assert_eq!(ledger.used(&pe), 40);
        assert_eq!(ledger.used_by(a, &pe), 10);
    }

    #[test]
    fn remove_workload_clears_usage() {
        let mut ledger = Ledger::default();
        let a = WorkloadId::new(1);
        ledger.set(a, &path("sys0.cpu0.pe0"), 40);
        ledger.set(a, &path("sys0.mem0"), 64);

        let removed = ledger.remove_workload(a);
        assert_eq!(removed.len(), 2);
        assert_eq!(ledger, Ledger::default());
    }

    #[test]
    fn zero_amount_removes_entry() {
        let mut ledger = Ledger::default();
        let a = WorkloadId::new(1);
        let pe = path("sys0.cpu0.pe0");
        ledger.set(a, &pe, 40);
        ledger.set(a, &pe, 0);
        assert_eq!(ledger, Ledger::default());
    }
}
