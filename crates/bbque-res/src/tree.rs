//! Resource tree: the platform inventory.
//!
//! Nodes are keyed by their concrete path in a `BTreeMap`, which gives the
//! stable path order every listing relies on. Capacities are informational
//! on inner nodes; accounting happens on leaves.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use serde::Serialize;
use tracing::{debug, info};

use bbque_core::ResourcePath;

use crate::error::{AccountError, AccountResult};

/// Number of degradation samples kept per resource.
pub const DEGRADATION_HISTORY: usize = 8;

/// One quantified node of the resource tree.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub path: ResourcePath,
    pub model: Option<String>,
    /// Total capacity in the resource's natural unit.
    pub capacity: u64,
    /// Amount currently taken out of service.
    pub offline: u64,
    /// Most recent degradation percentages, oldest first.
    pub degradation: VecDeque<u8>,
    pub high_performance: bool,
    /// No registered node lives below this one.
    pub leaf: bool,
}

impl Resource {
    fn new(path: ResourcePath, model: Option<String>, capacity: u64) -> Self {
        Self {
            path,
            model,
            capacity,
            offline: 0,
            degradation: VecDeque::with_capacity(DEGRADATION_HISTORY),
            high_performance: false,
            leaf: true,
        }
    }

    /// Capacity available to new reservations.
    pub fn effective_capacity(&self) -> u64 {
        self.capacity.saturating_sub(self.offline)
    }

    pub fn is_offline(&self) -> bool {
        self.offline > 0 && self.effective_capacity() == 0
    }

    /// Latest reported degradation, 0 when none was reported.
    pub fn degradation(&self) -> u8 {
        self.degradation.back().copied().unwrap_or(0)
    }
}

/// Hierarchical inventory of resource nodes.
#[derive(Debug, Default)]
pub struct ResourceTree {
    nodes: BTreeMap<ResourcePath, Resource>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node or replace the capacity of an existing one.
    ///
    /// Missing ancestors are created with zero capacity so that prefix
    /// listings see the whole hierarchy.
    pub fn register(
        &mut self,
        path: &ResourcePath,
        model: Option<String>,
        capacity: u64,
    ) -> AccountResult<&Resource> {
        if path.is_template() {
            return Err(AccountError::BadPath(path.to_string()));
        }

        let mut ancestor = path.parent();
        while let Some(p) = ancestor {
            let node = self
                .nodes
                .entry(p.clone())
                .or_insert_with(|| Resource::new(p.clone(), None, 0));
            node.leaf = false;
            ancestor = p.parent();
        }

        let has_children = self
            .nodes
            .range((Bound::Excluded(path.clone()), Bound::Unbounded))
            .next()
            .is_some_and(|(p, _)| path.matches_prefix(p));

        match self.nodes.get_mut(path) {
            Some(existing) => {
                if existing.capacity != capacity {
                    info!(
                        %path,
                        old = existing.capacity,
                        new = capacity,
                        "resource capacity replaced"
                    );
                }
                existing.capacity = capacity;
                if model.is_some() {
                    existing.model = model;
                }
            }
            None => {
                let mut node = Resource::new(path.clone(), model, capacity);
                node.leaf = !has_children;
                self.nodes.insert(path.clone(), node);
                debug!(%path, capacity, "resource registered");
            }
        }

        self.nodes
            .get(path)
            .ok_or_else(|| AccountError::BadPath(path.to_string()))
    }

    pub fn get(&self, path: &ResourcePath) -> Option<&Resource> {
        self.nodes.get(path)
    }

    pub(crate) fn get_mut(&mut self, path: &ResourcePath) -> AccountResult<&mut Resource> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| AccountError::BadPath(path.to_string()))
    }

    /// Nodes at the depth of `pattern` whose segments match it, in path order.
    pub fn list(&self, pattern: &ResourcePath) -> Vec<&Resource> {
        self.nodes
            .values()
            .filter(|r| pattern.matches(&r.path))
            .collect()
    }

    /// Leaves equal to or below the nodes matched by `pattern`, in path order.
    pub fn leaves(&self, pattern: &ResourcePath) -> Vec<&Resource> {
        self.nodes
            .values()
            .filter(|r| r.leaf && pattern.matches_prefix(&r.path))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
