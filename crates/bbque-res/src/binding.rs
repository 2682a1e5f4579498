//! Resource requests and their concrete bindings.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use bbque_core::{ResourcePath, ResourceType};

/// An amount requested on a (possibly templated) resource path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub path: ResourcePath,
    pub amount: u64,
}

impl ResourceRequest {
    pub fn new(path: ResourcePath, amount: u64) -> Self {
        Self { path, amount }
    }
}

/// Concrete mapping of requests onto leaf resources: path → amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBinding {
    amounts: BTreeMap<ResourcePath, u64>,
}

impl ResourceBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` on `path`, accumulating with any amount already bound there.
    pub fn bind(&mut self, path: ResourcePath, amount: u64) {
        if amount == 0 {
            return;
        }
        *self.amounts.entry(path).or_insert(0) += amount;
    }

    pub fn with(mut self, path: ResourcePath, amount: u64) -> Self {
        self.bind(path, amount);
        self
    }

    pub fn amount(&self, path: &ResourcePath) -> u64 {
        self.amounts.get(path).copied().unwrap_or(0)
    }

    /// Bound entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourcePath, u64)> {
        self.amounts.iter().map(|(p, a)| (p, *a))
    }

    pub fn paths(&self) -> BTreeSet<&ResourcePath> {
        self.amounts.keys().collect()
    }

    /// Sum of the amounts bound on paths matched by `pattern` (or below it).
    pub fn total(&self, pattern: &ResourcePath) -> u64 {
        self.amounts
            .iter()
            .filter(|(p, _)| pattern.matches_prefix(p))
            .map(|(_, a)| *a)
            .sum()
    }

    /// Bound paths that live under a CPU node.
    pub fn cpu_set(&self) -> BTreeSet<&ResourcePath> {
        self.amounts
            .keys()
            .filter(|p| p.contains_type(ResourceType::Cpu))
            .collect()
    }

    /// Distinct ids of the given type appearing in bound paths.
    pub fn ids_of(&self, kind: ResourceType) -> BTreeSet<u32> {
        self.amounts.keys().filter_map(|p| p.id_of(kind)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.amounts.len()
    }
}

/// True when two bindings map onto a different set of resources.
///
/// Only the set of bound leaves counts; a change of amount on the same
/// leaves is not a reshuffle.
pub fn is_reshuffling(prev: &ResourceBinding, next: &ResourceBinding) -> bool {
    prev.paths() != next.paths()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ResourcePath {
        p.parse().unwrap()
    }

    #[test]
    fn bind_accumulates_and_skips_zero() {
        let mut binding = ResourceBinding::new();
        binding.bind(path("sys0.cpu0.pe0"), 50);
        binding.bind(path("sys0.cpu0.pe0"), 25);
        binding.bind(path("sys0.cpu0.pe1"), 0);
        assert_eq!(binding.amount(&path("sys0.cpu0.pe0")), 75);
        assert_eq!(binding.len(), 1);
    }

    #[test]
    fn totals_and_cpu_set() {
        let binding = ResourceBinding::new()
            .with(path("sys0.cpu0.pe0"), 100)
            .with(path("sys0.cpu1.pe4"), 50)
            .with(path("sys0.mem0"), 512);
        assert_eq!(binding.total(&path("sys0.cpu*.pe")), 150);
        assert_eq!(binding.total(&path("sys0")), 662);
        assert_eq!(binding.cpu_set().len(), 2);
        assert_eq!(
            binding.ids_of(ResourceType::Cpu),
            BTreeSet::from([0, 1])
        );
    }

    #[test]
    fn reshuffling_is_structural() {
        let a = ResourceBinding::new()
            .with(path("sys0.cpu0.pe0"), 100)
            .with(path("sys0.cpu0.pe1"), 100);
        let same_cores_other_amounts = ResourceBinding::new()
            .with(path("sys0.cpu0.pe0"), 60)
            .with(path("sys0.cpu0.pe1"), 40);
        let other_cores = ResourceBinding::new()
            .with(path("sys0.cpu0.pe2"), 100)
            .with(path("sys0.cpu0.pe3"), 100);
        let extra_memory = a.clone().with(path("sys0.mem0"), 10);

        assert!(!is_reshuffling(&a, &a));
        assert!(!is_reshuffling(&a, &same_cores_other_amounts));
        assert!(is_reshuffling(&a, &other_cores));
        assert!(is_reshuffling(&a, &extra_memory));
    }
}
