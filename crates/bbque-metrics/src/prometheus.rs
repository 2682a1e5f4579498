//! Prometheus text exposition format.

use crate::collector::MetricsSnapshot;

/// Render a snapshot into Prometheus text format.
pub fn render_prometheus(s: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let counters = [
        ("bbque_sched_runs_total", "Scheduling rounds started.", s.sched_runs),
        ("bbque_sched_failed_total", "Rounds where the policy failed.", s.sched_failed),
        ("bbque_sched_empty_total", "Rounds with nothing to schedule.", s.sched_empty),
        ("bbque_rounds_aborted_total", "Rounds rolled back entirely.", s.rounds_aborted),
        ("bbque_sync_runs_total", "Synchronization rounds started.", s.sync_runs),
        ("bbque_sync_completed_total", "Synchronization rounds committed.", s.sync_completed),
        ("bbque_sync_hit_total", "Workloads that committed their assignment.", s.sync_hit),
        ("bbque_sync_miss_total", "Workloads aborted during synchronization.", s.sync_miss),
    ];
    for (name, help, value) in counters {
        out.push_str(&format!("# HELP {name} {help}\n"));
        out.push_str(&format!("# TYPE {name} counter\n"));
        out.push_str(&format!("{name} {value}\n"));
    }

    out.push_str("# HELP bbque_sync_state_total Workloads that entered a sync-state.\n");
    out.push_str("# TYPE bbque_sync_state_total counter\n");
    for (state, count) in &s.sync_states {
        out.push_str(&format!(
            "bbque_sync_state_total{{state=\"{state}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP bbque_sync_phase_p50_ms P50 phase latency in milliseconds.\n");
    out.push_str("# TYPE bbque_sync_phase_p50_ms gauge\n");
    for (phase, t) in &s.phases {
        out.push_str(&format!(
            "bbque_sync_phase_p50_ms{{phase=\"{phase}\"}} {:.2}\n",
            t.p50_ms
        ));
    }

    out.push_str("# HELP bbque_sync_phase_p99_ms P99 phase latency in milliseconds.\n");
    out.push_str("# TYPE bbque_sync_phase_p99_ms gauge\n");
    for (phase, t) in &s.phases {
        out.push_str(&format!(
            "bbque_sync_phase_p99_ms{{phase=\"{phase}\"}} {:.2}\n",
            t.p99_ms
        ));
    }

    out
}
