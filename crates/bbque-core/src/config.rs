//! bbque.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BbqueConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub accounter: AccounterConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub recipes: Vec<RecipeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: String,
    /// Delay applied to workload-set events to fold bursts into one round.
    pub opts_defer_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: "priority-fit".to_string(),
            opts_defer_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub policy: String,
    pub rpc_timeout_ms: u64,
    pub safety_factor: f64,
    pub min_phase_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            policy: "sasb".to_string(),
            rpc_timeout_ms: 500,
            safety_factor: 2.0,
            min_phase_timeout_ms: 100,
        }
    }
}

impl SyncConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn min_phase_timeout(&self) -> Duration {
        Duration::from_millis(self.min_phase_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccounterConfig {
    pub max_views: usize,
}

impl Default for AccounterConfig {
    fn default() -> Self {
        Self { max_views: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Periodic checkpoint of running workloads, 0 disables it.
    pub checkpoint_period_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Latency reported by simulated workloads during PreChange.
    pub rpc_latency_ms: u64,
    /// Probe workload pids with a null signal when a phase fails.
    /// Off, every workload is assumed alive.
    pub check_liveness: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rpc_latency_ms: 5,
            check_liveness: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub path: String,
    pub capacity: u64,
    pub model: Option<String>,
    #[serde(default)]
    pub high_performance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    pub name: String,
    #[serde(default)]
    pub modes: Vec<WorkingModeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingModeConfig {
    pub id: u8,
    pub name: String,
    pub value: u32,
    /// Resource path template → requested amount.
    pub requests: BTreeMap<String, u64>,
}

impl BbqueConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BbqueConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a configuration describing a small single-socket platform.
    pub fn scaffold(cores: u32) -> Self {
        let mut resources: Vec<ResourceConfig> = (0..cores)
            .map(|pe| ResourceConfig {
                path: format!("sys0.cpu0.pe{pe}"),
                capacity: 100,
                model: None,
                high_performance: pe < cores / 2,
            })
            .collect();
        resources.push(ResourceConfig {
            path: "sys0.mem0".to_string(),
            capacity: 4096,
            model: Some("dram".to_string()),
            high_performance: false,
        });

        let mut low = BTreeMap::new();
        low.insert("sys0.cpu0.pe".to_string(), 100);
        low.insert("sys0.mem0".to_string(), 256);
        let mut high = BTreeMap::new();
        high.insert("sys0.cpu0.pe".to_string(), u64::from(cores.max(1)) * 50);
        high.insert("sys0.mem0".to_string(), 512);

        BbqueConfig {
            resources,
            recipes: vec![RecipeConfig {
                name: "default".to_string(),
                modes: vec![
                    WorkingModeConfig {
                        id: 0,
                        name: "low".to_string(),
                        value: 5,
                        requests: low,
                    },
                    WorkingModeConfig {
                        id: 1,
                        name: "high".to_string(),
                        value: 10,
                        requests: high,
                    },
                ],
            }],
            ..Default::default()
        }
    }
}
