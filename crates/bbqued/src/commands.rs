//! Text command channel.
//!
//! One command per line. Each command answers with zero or more output
//! lines followed by `ok` or `err <code>`.
//!
//! ```text
//! add <name>                       manage processes called <name>
//! remove <name>
//! setsched -n <name> [-p <pid>] -c <cpus> [-g <gpus>] [-a <accs>] [-m <mem>]
//! start <name> <pid>               a process started
//! exit <pid>                       a process or application exited
//! app <pid> <name> <prio> <recipe> register an adaptive application
//! freeze <pid> | thaw <pid> | checkpoint <pid> | restore <pid> <name>
//! notify_degradation <path> <pct> [<path> <pct>...]
//! simulate_fault <path>
//! checkpoint_period <secs|off>
//! status | metrics | schedule
//! ```

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use bbque_app::{AppError, ScheduleRequest, State, WorkloadKind};
use bbque_core::{LOWEST_PRIORITY, Pid, Priority, WorkloadId};
use bbque_metrics::render_prometheus;
use bbque_sched::EventKind;

use crate::daemon::Daemon;
use crate::error::{CommandError, CommandResult};

#[derive(Parser, Debug)]
#[command(name = "bbque", no_binary_name = true, disable_help_subcommand = true)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage processes with this executable name.
    Add { name: String },

    /// Stop managing an executable name.
    Remove { name: String },

    /// Set the resource request of a managed name.
    Setsched {
        #[arg(short = 'n')]
        name: String,
        /// Apply to this running instance too.
        #[arg(short = 'p')]
        pid: Option<Pid>,
        #[arg(short = 'c', default_value_t = 1)]
        cpus: u32,
        #[arg(short = 'g', default_value_t = 0)]
        gpus: u32,
        #[arg(short = 'a', default_value_t = 0)]
        accs: u32,
        /// Memory in MB.
        #[arg(short = 'm', default_value_t = 0)]
        mem: u64,
    },

    /// A process started.
    Start { name: String, pid: Pid },

    /// A process or application exited.
    Exit { pid: Pid },

    /// Register an adaptive application.
    App {
        pid: Pid,
        name: String,
        priority: Priority,
        recipe: String,
    },

    Freeze { pid: Pid },

    Thaw { pid: Pid },

    Checkpoint { pid: Pid },

    Restore { pid: Pid, name: String },

    #[command(name = "notify_degradation")]
    NotifyDegradation {
        #[arg(required = true, num_args = 1..)]
        pairs: Vec<String>,
    },

    #[command(name = "simulate_fault")]
    SimulateFault { path: String },

    #[command(name = "checkpoint_period")]
    CheckpointPeriod { period: String },

    /// Dump the status and run a round.
    Schedule,

    Status,

    Metrics,
}

/// Run one command line. Returns the output to print before `ok`.
pub async fn execute(daemon: &Daemon, line: &str) -> CommandResult<String> {
    let cli = CommandLine::try_parse_from(line.split_whitespace())
        .map_err(|e| CommandError::Usage(e.to_string().trim_end().to_string()))?;
    debug!(command = ?cli.command, "command received");

    match cli.command {
        Command::Add { name } => {
            daemon.processes.add(&name);
            Ok(String::new())
        }
        Command::Remove { name } => {
            if !daemon.processes.remove(&name) {
                return Err(AppError::NotManaged(name).into());
            }
            Ok(String::new())
        }
        Command::Setsched {
            name,
            pid,
            cpus,
            gpus,
            accs,
            mem,
        } => {
            let request = ScheduleRequest {
                cpu_cores: cpus,
                gpu_units: gpus,
                acc_cores: accs,
                memory_mb: mem,
            };
            daemon.processes.set_schedule(&name, pid, request)?;
            daemon.scheduler.notify_event(EventKind::Opts);
            Ok(String::new())
        }
        Command::Start { name, pid } => {
            if daemon.processes.notify_start(&name, pid)? {
                daemon.scheduler.notify_event(EventKind::Opts);
                return Ok(String::new());
            }
            Ok(format!("{name}: not managed"))
        }
        Command::Exit { pid } => {
            let id = WorkloadId::new(pid);
            let workload = daemon.registry.get(id).ok_or(AppError::NotFound(id))?;
            let needs_round = if workload.is_process() {
                daemon.processes.notify_exit(pid)?
            } else {
                daemon.registry.notify_exit(id)?
            };
            if needs_round {
                daemon.scheduler.notify_event(EventKind::Opts);
            }
            Ok(String::new())
        }
        Command::App {
            pid,
            name,
            priority,
            recipe,
        } => {
            if priority > LOWEST_PRIORITY {
                return Err(CommandError::Usage(format!(
                    "priority {priority} out of range 0..={LOWEST_PRIORITY}"
                )));
            }
            let recipe = daemon
                .recipes
                .get(&recipe)
                .ok_or(CommandError::UnknownRecipe(recipe))?;
            let id = WorkloadId::new(pid);
            daemon.registry.register(
                id,
                &name,
                WorkloadKind::Adaptive(Arc::clone(recipe)),
                priority,
            )?;
            daemon.registry.notify_start(id)?;
            daemon.scheduler.notify_event(EventKind::Opts);
            Ok(String::new())
        }
        Command::Freeze { pid } => {
            daemon.reliability.freeze(pid).await?;
            Ok(String::new())
        }
        Command::Thaw { pid } => {
            daemon.reliability.thaw(pid).await?;
            Ok(String::new())
        }
        Command::Checkpoint { pid } => {
            daemon.reliability.checkpoint(pid).await?;
            Ok(String::new())
        }
        Command::Restore { pid, name } => {
            daemon.reliability.restore(pid, &name)?;
            Ok(String::new())
        }
        Command::NotifyDegradation { pairs } => {
            let applied = daemon.reliability.notify_degradation(&pairs)?;
            Ok(format!("{applied} resources updated"))
        }
        Command::SimulateFault { path } => {
            let faulted = daemon.reliability.simulate_fault(&path).await?;
            Ok(format!("{faulted} resources offline"))
        }
        Command::CheckpointPeriod { period } => {
            let period = match period.as_str() {
                "off" | "0" => None,
                secs => Some(Duration::from_secs(secs.parse().map_err(|_| {
                    CommandError::Usage(format!("not a period: {secs}"))
                })?)),
            };
            daemon.reliability.set_checkpoint_period(period);
            Ok(String::new())
        }
        Command::Schedule => {
            daemon.scheduler.notify_event(EventKind::Usr1);
            Ok(String::new())
        }
        Command::Status => Ok(status(daemon)),
        Command::Metrics => Ok(render_prometheus(&daemon.metrics.snapshot().await)
            .trim_end()
            .to_string()),
    }
}

/// One line per workload, then one per leaf resource.
pub fn status(daemon: &Daemon) -> String {
    let mut out = String::new();
    for w in daemon.registry.all() {
        let g = w.lock();
        let mode = g
            .current()
            .map(|a| a.mode.name.as_str())
            .unwrap_or("-");
        let _ = writeln!(
            out,
            "{:<8} {:<16} {:<10} {:<11} prio={} mode={}",
            w.id(),
            w.name(),
            g.state(),
            g.sync_state(),
            w.priority(),
            mode,
        );
    }

    let committed = daemon.accounter.committed_token();
    for path in daemon
        .config
        .resources
        .iter()
        .filter_map(|r| r.path.parse().ok())
    {
        let Some(resource) = daemon.accounter.get(&path) else {
            continue;
        };
        let used = daemon.accounter.used(&path, committed).unwrap_or(0);
        let _ = writeln!(
            out,
            "{:<20} {:>8}/{:<8} offline={} degradation={}%",
            path,
            used,
            resource.capacity,
            resource.offline,
            resource.degradation(),
        );
    }
    let _ = write!(
        out,
        "workloads={} running={} frozen={}",
        daemon.registry.len(),
        daemon.registry.count(State::Running),
        daemon.registry.count(State::Frozen),
    );
    out
}

/// Serve commands read from `reader` until EOF or shutdown.
pub async fn serve<R, W>(
    daemon: &Daemon,
    reader: R,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    info!("command channel open");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => break,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let reply = match execute(daemon, line).await {
            Ok(output) if output.is_empty() => "ok\n".to_string(),
            Ok(output) => format!("{output}\nok\n"),
            Err(e) => {
                warn!(command = line, error = %e, "command failed");
                format!("{e}\nerr {}\n", e.code())
            }
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }

    info!("command channel closed");
    Ok(())
}
