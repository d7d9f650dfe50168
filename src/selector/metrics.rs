//! Selector metrics. All recording goes through the `metrics` facade and is a
//! no-op until a recorder is installed.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use super::types::{MonitorCandidate, MonitorStatus, ServerStatus, StatusChange, ViolationType};

pub fn record_status_change(server_id: i32, monitor: &MonitorCandidate, change: &StatusChange) {
    counter!(
        "selector_status_changes_total",
        "monitor_id_token" => monitor.id_token.clone(),
        "monitor_tls_name" => monitor.tls_name.clone(),
        "from_status" => change.from_status.as_str(),
        "to_status" => change.to_status.as_str(),
        "server_id" => server_id.to_string(),
        "reason" => change.reason.clone()
    )
    .increment(1);
}

pub fn record_constraint_violation(server_id: i32, monitor: &MonitorCandidate) {
    let violation = &monitor.violation;
    counter!(
        "selector_constraint_violations_total",
        "monitor_id_token" => monitor.id_token.clone(),
        "monitor_tls_name" => monitor.tls_name.clone(),
        "server_id" => server_id.to_string(),
        "constraint_type" => violation.kind.as_str(),
        "is_grandfathered" => violation.is_grandfathered.to_string()
    )
    .increment(1);
}

pub fn record_process_duration(server_id: i32, elapsed: Duration) {
    histogram!("selector_process_duration_seconds", "server_id" => server_id.to_string())
        .record(elapsed.as_secs_f64());
}

/// Pool sizes, globally active monitors and constraint-blocked monitors after a pass.
pub fn record_pool(server_id: i32, monitors: &[MonitorCandidate]) {
    let server_label = server_id.to_string();

    counter!("selector_monitors_evaluated_total", "server_id" => server_label.clone())
        .increment(monitors.len() as u64);

    for status in [
        ServerStatus::Active,
        ServerStatus::Testing,
        ServerStatus::Candidate,
        ServerStatus::Paused,
    ] {
        let size = monitors.iter().filter(|m| m.server_status == status).count();
        gauge!(
            "selector_monitor_pool_size",
            "status" => status.as_str(),
            "server_id" => server_label.clone()
        )
        .set(size as f64);
    }

    let globally_active = monitors
        .iter()
        .filter(|m| m.global_status == MonitorStatus::Active)
        .count();
    gauge!("selector_globally_active_monitors", "server_id" => server_label.clone())
        .set(globally_active as f64);

    // Every kind is written each pass so cleared violations drop back to zero.
    for kind in ViolationType::VIOLATIONS {
        let count = monitors.iter().filter(|m| m.violation.kind == kind).count();
        gauge!(
            "selector_constraint_blocked_monitors",
            "constraint_type" => kind.as_str(),
            "server_id" => server_label.clone()
        )
        .set(count as f64);

        for monitor in monitors {
            let grandfathered =
                monitor.violation.kind == kind && monitor.violation.is_grandfathered;
            gauge!(
                "selector_grandfathered_violations",
                "monitor_id_token" => monitor.id_token.clone(),
                "monitor_tls_name" => monitor.tls_name.clone(),
                "server_id" => server_label.clone(),
                "constraint_type" => kind.as_str()
            )
            .set(if grandfathered { 1.0 } else { 0.0 });
        }
    }
}

pub fn record_change_results(server_id: i32, applied: usize, failed: usize) {
    counter!("selector_changes_applied_total", "server_id" => server_id.to_string())
        .increment(applied as u64);
    counter!("selector_changes_failed_total", "server_id" => server_id.to_string())
        .increment(failed as u64);
}
