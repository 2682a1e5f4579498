//! bbqued: the bbque daemon.
//!
//! Single binary that assembles the scheduling engine:
//! - Resource accounter loaded from the platform
//! - Workload registry and process tracker
//! - Scheduler + synchronization manager
//! - Reliability paths (freeze, checkpoint, restore, faults)
//! - Metrics collector
//! - Command channel on stdin
//!
//! # Usage
//!
//! ```text
//! bbqued run --config /etc/bbque/bbque.toml
//! bbqued check-config --config bbque.toml
//! bbqued scaffold --cores 8 > bbque.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bbque_core::BbqueConfig;
use bbque_sched::EventKind;
use bbqued::Daemon;

#[derive(Parser)]
#[command(name = "bbqued", about = "bbque scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon, reading commands from stdin.
    Run {
        /// Path to bbque.toml.
        #[arg(long, default_value = "bbque.toml")]
        config: PathBuf,

        /// Log as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a configuration and print a summary.
    CheckConfig {
        #[arg(long, default_value = "bbque.toml")]
        config: PathBuf,
    },
    /// Print a sample configuration.
    Scaffold {
        /// Processing elements of the sample machine.
        #[arg(long, default_value = "4")]
        cores: u32,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bbqued=debug,bbque=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(dispatch(cli));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run { config, log_json } => {
            init_tracing(log_json);
            run(config).await
        }
        Command::CheckConfig { config } => {
            let parsed = BbqueConfig::from_file(&config)?;
            let summary = bbqued::validate(&parsed)?;
            println!("{}: ok", config.display());
            println!("{summary}");
            Ok(())
        }
        Command::Scaffold { cores } => {
            print!("{}", BbqueConfig::scaffold(cores).to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = ?config_path, "bbque daemon starting");
    let config = BbqueConfig::from_file(&config_path)?;

    // ── Initialize subsystems ──────────────────────────────────

    let daemon = Arc::new(Daemon::build(config).await?);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let handles = daemon.spawn_tasks(&shutdown_rx);

    let commands_daemon = Arc::clone(&daemon);
    let commands_shutdown = shutdown_rx.clone();
    let commands_handle = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) =
            bbqued::serve(&commands_daemon, stdin, tokio::io::stdout(), commands_shutdown).await
        {
            tracing::error!(error = %e, "command channel error");
        }
    });

    // ── Signals ────────────────────────────────────────────────

    let mut usr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = usr1.recv() => daemon.scheduler.notify_event(EventKind::Usr1),
        }
    }
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }
    commands_handle.abort();

    info!("bbque daemon stopped");
    Ok(())
}
