//! Daemon assembly.
//!
//! Builds every subsystem from a [`BbqueConfig`] and runs the background
//! tasks: scheduler loop, metrics loop and periodic checkpoints.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use bbque_app::{ProcessManager, Recipe, WorkingMode, WorkloadRegistry};
use bbque_core::BbqueConfig;
use bbque_core::ResourcePath;
use bbque_core::config::RecipeConfig;
use bbque_metrics::MetricsCollector;
use bbque_res::ResourceAccounter;
use bbque_sched::{SchedulerManager, scheduler_policy, sync_policy};
use bbque_sync::{AssumeAlive, ProcessLiveness, SignalLiveness, SynchronizationManager, populate};

use crate::reliability::ReliabilityManager;
use crate::simulation::{LoopbackRpc, SimulatedPlatform};

/// Build the in-memory recipes described by `[[recipes]]`.
pub fn build_recipes(configs: &[RecipeConfig]) -> anyhow::Result<BTreeMap<String, Arc<Recipe>>> {
    let mut recipes = BTreeMap::new();
    for rc in configs {
        if rc.modes.is_empty() {
            bail!("recipe {}: no working modes", rc.name);
        }
        let mut modes = Vec::with_capacity(rc.modes.len());
        for mc in &rc.modes {
            let mut mode = WorkingMode::new(mc.id, &mc.name, mc.value);
            for (path, amount) in &mc.requests {
                let path: ResourcePath = path
                    .parse()
                    .with_context(|| format!("recipe {} mode {}", rc.name, mc.name))?;
                mode = mode.with_request(path, *amount);
            }
            modes.push(mode);
        }
        let recipe = Recipe::new(&rc.name, modes)?;
        if recipes.insert(rc.name.clone(), Arc::new(recipe)).is_some() {
            bail!("recipe {} defined twice", rc.name);
        }
    }
    Ok(recipes)
}

/// What `check-config` reports about a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSummary {
    pub resources: usize,
    pub high_performance: usize,
    pub recipes: Vec<(String, usize)>,
    pub scheduler_policy: String,
    pub sync_policy: String,
}

impl fmt::Display for ConfigSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "resources: {} ({} high-performance)",
            self.resources, self.high_performance
        )?;
        writeln!(f, "policies: scheduler={} sync={}", self.scheduler_policy, self.sync_policy)?;
        write!(f, "recipes:")?;
        for (name, modes) in &self.recipes {
            write!(f, " {name}({modes} modes)")?;
        }
        Ok(())
    }
}

/// Check a configuration without starting anything.
pub fn validate(config: &BbqueConfig) -> anyhow::Result<ConfigSummary> {
    if config.resources.is_empty() {
        bail!("no [[resources]] configured");
    }
    for r in &config.resources {
        let path: ResourcePath = r
            .path
            .parse()
            .with_context(|| format!("resource {}", r.path))?;
        if path.is_template() {
            bail!("resource {}: a concrete path is required", r.path);
        }
    }
    if config.accounter.max_views == 0 {
        bail!("accounter.max_views must be at least 1");
    }
    if config.sync.safety_factor < 1.0 {
        bail!("sync.safety_factor must be at least 1.0");
    }
    let scheduler = scheduler_policy(&config.scheduler.policy)?;
    let sync = sync_policy(&config.sync.policy)?;
    let recipes = build_recipes(&config.recipes)?;

    Ok(ConfigSummary {
        resources: config.resources.len(),
        high_performance: config.resources.iter().filter(|r| r.high_performance).count(),
        recipes: recipes
            .iter()
            .map(|(name, r)| (name.clone(), r.modes().len()))
            .collect(),
        scheduler_policy: scheduler.name().to_string(),
        sync_policy: sync.name().to_string(),
    })
}

/// Every subsystem of a running daemon.
pub struct Daemon {
    pub config: BbqueConfig,
    pub registry: Arc<WorkloadRegistry>,
    pub accounter: Arc<ResourceAccounter>,
    pub processes: Arc<ProcessManager>,
    pub recipes: BTreeMap<String, Arc<Recipe>>,
    pub platform: Arc<SimulatedPlatform>,
    pub rpc: Arc<LoopbackRpc>,
    pub metrics: Arc<MetricsCollector>,
    pub sync: Arc<SynchronizationManager>,
    pub scheduler: Arc<SchedulerManager>,
    pub reliability: Arc<ReliabilityManager>,
}

impl Daemon {
    pub async fn build(config: BbqueConfig) -> anyhow::Result<Self> {
        let liveness: Arc<dyn ProcessLiveness> = if config.simulation.check_liveness {
            Arc::new(SignalLiveness)
        } else {
            Arc::new(AssumeAlive)
        };
        Self::build_with(config, liveness).await
    }

    pub async fn build_with(
        config: BbqueConfig,
        liveness: Arc<dyn ProcessLiveness>,
    ) -> anyhow::Result<Self> {
        validate(&config)?;
        let recipes = build_recipes(&config.recipes)?;

        // ── Platform and resources ─────────────────────────────
        let accounter = Arc::new(ResourceAccounter::new(config.accounter.max_views));
        let platform = Arc::new(SimulatedPlatform::new(&config.resources));
        let registered = populate(platform.as_ref(), &accounter).await?;
        info!(resources = registered, "resource accounter initialized");

        // ── Workloads ──────────────────────────────────────────
        let registry = Arc::new(WorkloadRegistry::new());
        let processes = Arc::new(ProcessManager::new(Arc::clone(&registry)));

        // ── Metrics ────────────────────────────────────────────
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(
            config.metrics.interval_secs,
        )));

        // ── Synchronization ────────────────────────────────────
        let rpc = Arc::new(LoopbackRpc::new(Duration::from_millis(
            config.simulation.rpc_latency_ms,
        )));
        let sync = Arc::new(SynchronizationManager::new(
            Arc::clone(&registry),
            Arc::clone(&accounter),
            sync_policy(&config.sync.policy)?,
            rpc.clone(),
            platform.clone(),
            liveness,
            Arc::clone(&metrics),
            config.sync.clone(),
        ));
        info!(policy = %config.sync.policy, "synchronization manager initialized");

        // ── Scheduler ──────────────────────────────────────────
        let scheduler = Arc::new(SchedulerManager::new(
            Arc::clone(&registry),
            Arc::clone(&accounter),
            scheduler_policy(&config.scheduler.policy)?,
            Arc::clone(&sync),
            Arc::clone(&metrics),
            config.scheduler.clone(),
        ));
        info!(policy = scheduler.policy_name(), "scheduler initialized");

        // ── Reliability ────────────────────────────────────────
        let reliability = Arc::new(ReliabilityManager::new(
            Arc::clone(&registry),
            Arc::clone(&accounter),
            Arc::clone(&processes),
            recipes.clone(),
            platform.clone(),
            Arc::clone(&scheduler),
            config.reliability.checkpoint_period_secs,
        ));

        Ok(Self {
            config,
            registry,
            accounter,
            processes,
            recipes,
            platform,
            rpc,
            metrics,
            sync,
            scheduler,
            reliability,
        })
    }

    /// Start the background tasks. They stop when `shutdown` flips.
    pub fn spawn_tasks(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_shutdown = shutdown.clone();
        let metrics = Arc::clone(&self.metrics);
        let metrics_shutdown = shutdown.clone();
        let reliability = Arc::clone(&self.reliability);
        let checkpoint_shutdown = shutdown.clone();

        vec![
            tokio::spawn(async move {
                scheduler.run(scheduler_shutdown).await;
            }),
            tokio::spawn(async move {
                metrics.run(metrics_shutdown).await;
            }),
            tokio::spawn(async move {
                reliability.run_checkpoints(checkpoint_shutdown).await;
            }),
        ]
    }
}
