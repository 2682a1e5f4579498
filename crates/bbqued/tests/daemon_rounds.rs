//! Daemon round tests.
//!
//! Builds the whole daemon on a simulated four-core machine, drives it
//! through the command channel and runs scheduling rounds by hand.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use bbque_app::{State, SyncState};
use bbque_core::BbqueConfig;
use bbque_core::config::{RecipeConfig, WorkingModeConfig};
use bbque_core::{ResourcePath, WorkloadId};
use bbque_sched::{EventKind, RoundOutcome};
use bbque_sync::SyncOutcome;
use bbqued::{Daemon, execute, serve};

fn mode(id: u8, name: &str, value: u32, pe: u64) -> WorkingModeConfig {
    let mut requests = BTreeMap::new();
    requests.insert("sys0.cpu0.pe".to_string(), pe);
    WorkingModeConfig {
        id,
        name: name.to_string(),
        value,
        requests,
    }
}

fn make_config(pes: u32) -> BbqueConfig {
    let mut config = BbqueConfig::scaffold(pes);
    for r in &mut config.resources {
        r.high_performance = false;
    }
    config.simulation.rpc_latency_ms = 1;
    config.recipes = vec![
        RecipeConfig {
            name: "wide".to_string(),
            modes: vec![mode(0, "wide", 10, 150)],
        },
        RecipeConfig {
            name: "half".to_string(),
            modes: vec![mode(0, "half", 10, 50)],
        },
    ];
    config
}

async fn make_daemon() -> Daemon {
    Daemon::build(make_config(4)).await.unwrap()
}

fn path(p: &str) -> ResourcePath {
    p.parse().unwrap()
}

fn pe(n: u32) -> ResourcePath {
    path(&format!("sys0.cpu0.pe{n}"))
}

fn committed_on(daemon: &Daemon, id: WorkloadId, pattern: &ResourcePath) -> u64 {
    daemon
        .accounter
        .used_by(id, pattern, daemon.accounter.committed_token())
        .unwrap()
}

fn state_of(daemon: &Daemon, pid: u32) -> Option<State> {
    daemon.registry.get(WorkloadId::new(pid)).map(|w| w.state())
}

/// No leaf is reserved beyond its effective capacity.
fn assert_conservation(daemon: &Daemon) {
    let committed = daemon.accounter.committed_token();
    for leaf in daemon.accounter.leaves(&path("sys0")) {
        let used = daemon.accounter.used(&leaf.path, committed).unwrap();
        assert!(
            used <= leaf.capacity,
            "{} over capacity: {used}/{}",
            leaf.path,
            leaf.capacity
        );
    }
}

async fn synced(daemon: &Daemon) -> SyncOutcome {
    match daemon.scheduler.schedule().await.unwrap() {
        RoundOutcome::Synced(outcome) => outcome,
        other => panic!("expected a synchronized round, got {other:?}"),
    }
}

#[tokio::test]
async fn wide_mode_spreads_over_two_pes() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 wide").await.unwrap();
    let id = WorkloadId::new(100);

    let outcome = synced(&daemon).await;
    assert_eq!(outcome.committed, vec![id]);
    assert!(outcome.adopted);

    assert_eq!(state_of(&daemon, 100), Some(State::Running));
    assert_eq!(committed_on(&daemon, id, &path("sys0.cpu0")), 150);
    assert_eq!(committed_on(&daemon, id, &pe(0)), 100);
    assert_eq!(committed_on(&daemon, id, &pe(1)), 50);
    assert_eq!(
        daemon.platform.mapped(id).unwrap().total(&path("sys0.cpu0.pe")),
        150
    );
    assert_conservation(&daemon);
}

#[tokio::test]
async fn workload_that_does_not_fit_stays_ready() {
    let daemon = make_daemon().await;
    for pid in [100, 101, 102] {
        execute(&daemon, &format!("app {pid} w{pid} 5 wide"))
            .await
            .unwrap();
    }

    let mut outcome = synced(&daemon).await;
    outcome.committed.sort();
    assert_eq!(
        outcome.committed,
        vec![WorkloadId::new(100), WorkloadId::new(101)]
    );
    assert_eq!(state_of(&daemon, 102), Some(State::Ready));
    assert_eq!(committed_on(&daemon, WorkloadId::new(102), &path("sys0")), 0);
    assert_conservation(&daemon);
}

#[tokio::test]
async fn second_round_without_changes_is_unchanged() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 half").await.unwrap();
    synced(&daemon).await;

    assert_eq!(
        daemon.scheduler.schedule().await.unwrap(),
        RoundOutcome::Unchanged
    );
    assert_eq!(state_of(&daemon, 100), Some(State::Running));
    assert_eq!(committed_on(&daemon, WorkloadId::new(100), &pe(0)), 50);
}

#[tokio::test]
async fn thawed_workload_restarts() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 E 5 half").await.unwrap();
    synced(&daemon).await;
    let id = WorkloadId::new(100);

    execute(&daemon, "freeze 100").await.unwrap();
    assert_eq!(state_of(&daemon, 100), Some(State::Frozen));
    assert!(daemon.platform.is_frozen(id));
    assert_eq!(committed_on(&daemon, id, &pe(0)), 50);
    assert_eq!(
        daemon.scheduler.schedule().await.unwrap(),
        RoundOutcome::Empty
    );

    execute(&daemon, "thaw 100").await.unwrap();
    assert_eq!(state_of(&daemon, 100), Some(State::Thawed));

    let outcome = synced(&daemon).await;
    assert_eq!(outcome.committed, vec![id]);
    assert_eq!(state_of(&daemon, 100), Some(State::Running));
    assert!(!daemon.platform.is_frozen(id));
    assert_eq!(daemon.metrics.sync_state_count(SyncState::Starting), 2);
}

#[tokio::test(start_paused = true)]
async fn freeze_waits_for_the_round_in_progress() {
    let mut config = make_config(4);
    config.simulation.rpc_latency_ms = 1000;
    let daemon = Daemon::build(config).await.unwrap();
    execute(&daemon, "app 100 E 5 half").await.unwrap();
    let id = WorkloadId::new(100);

    let scheduler = Arc::clone(&daemon.scheduler);
    let round = tokio::spawn(async move { scheduler.schedule().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state_of(&daemon, 100), Some(State::Sync));

    // Lands once the round has committed the workload.
    execute(&daemon, "freeze 100").await.unwrap();
    match round.await.unwrap().unwrap() {
        RoundOutcome::Synced(outcome) => assert_eq!(outcome.committed, vec![id]),
        other => panic!("expected a synchronized round, got {other:?}"),
    }
    assert_eq!(state_of(&daemon, 100), Some(State::Frozen));
    assert!(daemon.platform.is_frozen(id));
    assert_eq!(
        daemon.platform.mapped(id).unwrap(),
        daemon.accounter.committed_binding(id)
    );
}

#[tokio::test]
async fn refused_sync_aborts_only_that_workload() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 F 5 half").await.unwrap();
    execute(&daemon, "app 101 G 5 half").await.unwrap();
    let f = WorkloadId::new(100);
    let g = WorkloadId::new(101);
    daemon.rpc.refuse_sync(f);

    let outcome = synced(&daemon).await;
    assert_eq!(outcome.aborted, vec![f]);
    assert_eq!(outcome.committed, vec![g]);
    assert_eq!(state_of(&daemon, 100), Some(State::Ready));
    assert_eq!(state_of(&daemon, 101), Some(State::Running));
    assert_eq!(committed_on(&daemon, f, &path("sys0")), 0);
    assert_eq!(committed_on(&daemon, g, &path("sys0")), 50);

    daemon.rpc.reset(f);
    let outcome = synced(&daemon).await;
    assert_eq!(outcome.committed, vec![f]);
}

#[tokio::test]
async fn unreachable_workload_is_aborted() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 F 5 half").await.unwrap();
    daemon.rpc.disconnect(WorkloadId::new(100));

    let outcome = synced(&daemon).await;
    assert_eq!(outcome.aborted, vec![WorkloadId::new(100)]);
    assert!(!outcome.adopted);
    assert_eq!(state_of(&daemon, 100), Some(State::Ready));
}

#[tokio::test]
async fn offline_pe_moves_its_workload() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 half").await.unwrap();
    synced(&daemon).await;
    let id = WorkloadId::new(100);
    assert_eq!(committed_on(&daemon, id, &pe(0)), 50);

    daemon.accounter.set_offline(&pe(0), 100).unwrap();
    assert_eq!(committed_on(&daemon, id, &pe(0)), 50);
    let view = daemon.accounter.open_view("inspect").unwrap();
    assert_eq!(daemon.accounter.available(&pe(0), view).unwrap(), 0);
    daemon.accounter.discard(view).unwrap();

    daemon.scheduler.notify_event(EventKind::Plat);
    let outcome = synced(&daemon).await;
    assert_eq!(outcome.committed, vec![id]);
    assert_eq!(committed_on(&daemon, id, &pe(0)), 0);
    assert_eq!(committed_on(&daemon, id, &path("sys0.cpu0")), 50);
    assert_eq!(daemon.metrics.sync_state_count(SyncState::Migrate), 1);
    assert_conservation(&daemon);
}

#[tokio::test]
async fn fault_freezes_holders_and_takes_pe_offline() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 half").await.unwrap();
    synced(&daemon).await;
    let id = WorkloadId::new(100);

    let out = execute(&daemon, "simulate_fault sys0.cpu0.pe0").await.unwrap();
    assert_eq!(out, "1 resources offline");
    assert_eq!(state_of(&daemon, 100), Some(State::Frozen));
    assert!(daemon.platform.is_frozen(id));
    assert!(daemon.accounter.get(&pe(0)).unwrap().is_offline());

    execute(&daemon, "thaw 100").await.unwrap();
    synced(&daemon).await;
    assert_eq!(state_of(&daemon, 100), Some(State::Running));
    assert_eq!(committed_on(&daemon, id, &pe(0)), 0);
    assert_eq!(committed_on(&daemon, id, &path("sys0.cpu0")), 50);
}

#[tokio::test]
async fn platform_crash_rolls_the_round_back() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 half").await.unwrap();
    daemon.platform.crash_next_map();

    let outcome = synced(&daemon).await;
    assert!(outcome.rolled_back);
    assert!(!outcome.adopted);
    assert_eq!(state_of(&daemon, 100), Some(State::Ready));
    assert_eq!(committed_on(&daemon, WorkloadId::new(100), &path("sys0")), 0);
    assert_eq!(daemon.metrics.rounds_aborted(), 1);

    synced(&daemon).await;
    assert_eq!(state_of(&daemon, 100), Some(State::Running));
}

#[tokio::test]
async fn mapping_failure_aborts_the_workload() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 half").await.unwrap();
    execute(&daemon, "app 101 B 5 half").await.unwrap();
    daemon.platform.fail_mapping(WorkloadId::new(100));

    let outcome = synced(&daemon).await;
    assert_eq!(outcome.aborted, vec![WorkloadId::new(100)]);
    assert_eq!(outcome.committed, vec![WorkloadId::new(101)]);
    assert_eq!(state_of(&daemon, 100), Some(State::Ready));
}

#[tokio::test]
async fn tracked_process_lifecycle() {
    let daemon = make_daemon().await;
    execute(&daemon, "add dd").await.unwrap();
    execute(&daemon, "setsched -n dd -c 2").await.unwrap();
    assert_eq!(
        execute(&daemon, "start ls 301").await.unwrap(),
        "ls: not managed"
    );
    execute(&daemon, "start dd 300").await.unwrap();
    let id = WorkloadId::new(300);
    assert_eq!(state_of(&daemon, 300), Some(State::Ready));

    synced(&daemon).await;
    assert_eq!(state_of(&daemon, 300), Some(State::Running));
    assert_eq!(committed_on(&daemon, id, &path("sys0.cpu0")), 200);
    assert_eq!(
        daemon.platform.mapped(id).unwrap().total(&path("sys.cpu.pe")),
        200
    );

    execute(&daemon, "exit 300").await.unwrap();
    assert_eq!(
        daemon.registry.get(id).unwrap().sync_state(),
        SyncState::Disabled
    );
    synced(&daemon).await;
    assert!(daemon.registry.get(id).is_none());
    assert_eq!(committed_on(&daemon, id, &path("sys0")), 0);
    assert!(daemon.platform.mapped(id).is_none());
}

#[tokio::test]
async fn checkpointed_application_is_restored() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 R 3 half").await.unwrap();
    synced(&daemon).await;
    let id = WorkloadId::new(100);

    execute(&daemon, "checkpoint 100").await.unwrap();
    assert!(daemon.platform.has_image(id));
    execute(&daemon, "exit 100").await.unwrap();
    synced(&daemon).await;
    assert!(daemon.registry.get(id).is_none());

    execute(&daemon, "restore 100 R").await.unwrap();
    let restored = daemon.registry.get(id).unwrap();
    assert_eq!(restored.state(), State::Restoring);
    assert_eq!(restored.priority(), 3);

    synced(&daemon).await;
    assert_eq!(state_of(&daemon, 100), Some(State::Running));
    assert_eq!(committed_on(&daemon, id, &path("sys0")), 50);
}

#[tokio::test]
async fn degradation_is_recorded() {
    let daemon = make_daemon().await;
    let out = execute(
        &daemon,
        "notify_degradation sys0.cpu0.pe0 20 sys0.cpu0.pe9 10 sys0.cpu0.pe1 x",
    )
    .await
    .unwrap();
    assert_eq!(out, "1 resources updated");
    assert_eq!(daemon.accounter.get(&pe(0)).unwrap().degradation(), 20);

    let err = execute(&daemon, "notify_degradation sys0.cpu0.pe0")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 1);
}

#[tokio::test]
async fn command_channel_reports_codes() {
    let daemon = make_daemon().await;
    let input = b"add dd\n\n# comment\nremove nope\nbogus\napp 1 x 3 missing\napp 2 y 11 half\nexit 77\nstatus\n";
    let mut out = Vec::new();
    let (_tx, rx) = watch::channel(false);

    serve(&daemon, &input[..], &mut out, rx).await.unwrap();

    let text = String::from_utf8(out).unwrap();
    let codes: Vec<&str> = text
        .lines()
        .filter(|l| *l == "ok" || l.starts_with("err "))
        .collect();
    assert_eq!(
        codes,
        ["ok", "err 2", "err 1", "err 5", "err 1", "err 2", "ok"]
    );
    assert!(text.contains("workloads=0"));
}

#[tokio::test]
async fn metrics_command_renders_counters() {
    let daemon = make_daemon().await;
    execute(&daemon, "app 100 A 5 half").await.unwrap();
    synced(&daemon).await;

    let out = execute(&daemon, "metrics").await.unwrap();
    assert!(out.contains("bbque_sched_runs_total 1"));
    assert!(out.contains("state=\"STARTING\""));
}

#[tokio::test(start_paused = true)]
async fn events_drive_rounds_and_checkpoints() {
    let daemon = Arc::new(make_daemon().await);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = daemon.spawn_tasks(&shutdown_rx);
    let id = WorkloadId::new(100);

    execute(&daemon, "app 100 A 5 half").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while state_of(&daemon, 100) != Some(State::Running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!daemon.platform.has_image(id));

    execute(&daemon, "checkpoint_period 10").await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(daemon.platform.has_image(id));

    execute(&daemon, "checkpoint_period off").await.unwrap();
    assert!(daemon.reliability.checkpoint_period().is_none());

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}
