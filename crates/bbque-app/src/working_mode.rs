//! Working modes, recipes, and assignments.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use bbque_core::ResourcePath;
use bbque_res::{ResourceBinding, ResourceRequest};

use crate::error::{AppError, AppResult};

/// A named bundle of resource requests with a quality-of-service value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingMode {
    pub id: u8,
    pub name: String,
    pub value: u32,
    pub requests: Vec<ResourceRequest>,
}

impl WorkingMode {
    pub fn new(id: u8, name: &str, value: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            value,
            requests: Vec::new(),
        }
    }

    pub fn with_request(mut self, path: ResourcePath, amount: u64) -> Self {
        self.requests.push(ResourceRequest::new(path, amount));
        self
    }
}

/// In-memory form of an application recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub name: String,
    modes: Vec<Arc<WorkingMode>>,
}

impl Recipe {
    /// Build a recipe, rejecting duplicate working mode ids.
    pub fn new(name: &str, modes: Vec<WorkingMode>) -> AppResult<Self> {
        let mut seen = std::collections::BTreeSet::new();
        for m in &modes {
            if !seen.insert(m.id) {
                return Err(AppError::DuplicateMode {
                    recipe: name.to_string(),
                    id: m.id,
                });
            }
        }
        Ok(Self {
            name: name.to_string(),
            modes: modes.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn modes(&self) -> &[Arc<WorkingMode>] {
        &self.modes
    }

    pub fn mode(&self, id: u8) -> Option<&Arc<WorkingMode>> {
        self.modes.iter().find(|m| m.id == id)
    }
}

/// Resource request of a tracked process, set from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub cpu_cores: u32,
    pub gpu_units: u32,
    pub acc_cores: u32,
    pub memory_mb: u64,
}

impl Default for ScheduleRequest {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            gpu_units: 0,
            acc_cores: 0,
            memory_mb: 0,
        }
    }
}

impl ScheduleRequest {
    /// Synthesize the single working mode a process can run in.
    ///
    /// Core counts are expressed in hundredths of a processing element.
    pub fn to_working_mode(&self) -> WorkingMode {
        let mut mode = WorkingMode::new(0, "process", 1);
        let wanted = [
            ("sys.cpu.pe", u64::from(self.cpu_cores) * 100),
            ("sys.gpu.pe", u64::from(self.gpu_units) * 100),
            ("sys.acc.pe", u64::from(self.acc_cores) * 100),
            ("sys.mem", self.memory_mb * 1024 * 1024),
        ];
        for (template, amount) in wanted {
            if amount == 0 {
                continue;
            }
            if let Ok(path) = template.parse::<ResourcePath>() {
                mode.requests.push(ResourceRequest::new(path, amount));
            }
        }
        mode
    }
}

/// A working mode bound onto concrete resources of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub mode: Arc<WorkingMode>,
    pub binding: ResourceBinding,
    /// Handle of the candidate binding this assignment was booked under.
    pub binding_ref: u64,
}

impl Assignment {
    pub fn new(mode: Arc<WorkingMode>, binding: ResourceBinding, binding_ref: u64) -> Self {
        Self {
            mode,
            binding,
            binding_ref,
        }
    }

    pub fn value(&self) -> u32 {
        self.mode.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_mode_ids_rejected() {
        let err = Recipe::new(
            "video",
            vec![WorkingMode::new(0, "low", 1), WorkingMode::new(0, "high", 2)],
        )
        .unwrap_err();
        assert!(matches!(err, AppError::DuplicateMode { id: 0, .. }));
    }

    #[test]
    fn recipe_lookup() {
        let recipe = Recipe::new(
            "video",
            vec![WorkingMode::new(0, "low", 1), WorkingMode::new(3, "high", 9)],
        )
        .unwrap();
        assert_eq!(recipe.mode(3).unwrap().value, 9);
        assert!(recipe.mode(1).is_none());
        assert_eq!(recipe.modes().len(), 2);
    }

    #[test]
    fn process_request_to_mode() {
        let request = ScheduleRequest {
            cpu_cores: 2,
            gpu_units: 0,
            acc_cores: 1,
            memory_mb: 64,
        };
        let mode = request.to_working_mode();
        let rendered: Vec<(String, u64)> = mode
            .requests
            .iter()
            .map(|r| (r.path.to_string(), r.amount))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("sys*.cpu*.pe*".to_string(), 200),
                ("sys*.acc*.pe*".to_string(), 100),
                ("sys*.mem*".to_string(), 64 * 1024 * 1024),
            ]
        );
    }
}
