use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::constraints::{
    build_account_limits, check_existing_assignment, enforce_per_account_limits, AccountLimits,
};
use super::grandfathering::is_grandfathered;
use super::metrics;
use super::rules::{RuleConfig, RuleEngine};
use super::state::classify;
use super::types::{
    ConstraintViolation, MonitorCandidate, PauseReason, ServerInfo, ServerStatus, ViolationType,
};
use super::SelectorError;
use crate::db::{SelectorStore, SelectorTx};

/// How long until a server is looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewIntervals {
    pub changed: chrono::Duration,
    pub unchanged: chrono::Duration,
}

impl Default for ReviewIntervals {
    fn default() -> Self {
        Self {
            changed: chrono::Duration::minutes(60),
            unchanged: chrono::Duration::minutes(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessOutcome {
    pub evaluated: usize,
    pub planned: usize,
    pub applied: usize,
    pub failed: usize,
    pub paused: usize,
}

impl ProcessOutcome {
    pub fn changed(&self) -> bool {
        self.applied > 0 || self.paused > 0
    }
}

/// Fills in each monitor's constraint verdict, grandfathering flag and
/// recommended state. `monitors` must be in priority order.
pub fn evaluate_monitors(
    monitors: &mut [MonitorCandidate],
    server: &ServerInfo,
    limits: &AccountLimits,
) {
    let mut limit_violations = enforce_per_account_limits(monitors, limits);

    for idx in 0..monitors.len() {
        let mut violation = match limit_violations.remove(&monitors[idx].id) {
            Some(violation) => violation,
            None => check_existing_assignment(monitors, idx, server),
        };

        let monitor = &mut monitors[idx];
        if violation.is_violation() {
            violation.is_grandfathered = is_grandfathered(monitor, &violation);
            violation.since = monitor
                .recorded_violation
                .filter(|(kind, _)| *kind == violation.kind)
                .map(|(_, since)| since);
        }
        monitor.violation = violation;
        monitor.recommended_state = classify(monitor, server.id);

        debug!(
            server_id = server.id,
            monitor_id = monitor.id,
            status = %monitor.server_status,
            state = %monitor.recommended_state,
            violation = %monitor.violation.kind,
            grandfathered = monitor.violation.is_grandfathered,
            priority = monitor.priority,
            "Evaluated monitor."
        );
    }
}

/// Runs one review of one server inside its own transaction.
pub struct Processor {
    engine: RuleEngine,
    intervals: ReviewIntervals,
}

impl Processor {
    pub fn new(rules: RuleConfig, intervals: ReviewIntervals) -> Self {
        Self {
            engine: RuleEngine::new(rules),
            intervals,
        }
    }

    pub async fn process_server<S: SelectorStore>(
        &self,
        store: &S,
        server_id: i32,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, SelectorError> {
        let started = Instant::now();
        let mut tx = store.begin().await?;

        let server = ServerInfo::from(tx.get_server(server_id).await?);
        let mut monitors = tx
            .get_monitor_priority(server_id)
            .await?
            .into_iter()
            .map(MonitorCandidate::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let limits = build_account_limits(&monitors);
        evaluate_monitors(&mut monitors, &server, &limits);

        let selection = self.engine.select(&server, &monitors, &limits);
        let mut outcome = ProcessOutcome {
            evaluated: monitors.len(),
            planned: selection.changes.len(),
            ..Default::default()
        };

        for change in &selection.changes {
            if cancel.is_cancelled() {
                warn!(server_id, applied = outcome.applied, "Cancelled while applying changes.");
                return Err(SelectorError::Cancelled);
            }

            match tx
                .update_server_score_status(server_id, change.monitor_id, change.to_status)
                .await
            {
                Ok(()) => {
                    outcome.applied += 1;
                    if let Some(monitor) = monitors.iter_mut().find(|m| m.id == change.monitor_id) {
                        info!(
                            server_id,
                            monitor_id = change.monitor_id,
                            monitor = monitor.label(),
                            from = %change.from_status,
                            to = %change.to_status,
                            reason = %change.reason,
                            "Applied status change."
                        );
                        metrics::record_status_change(server_id, monitor, change);
                        monitor.server_status = change.to_status;
                    }
                }
                Err(e) => {
                    outcome.failed += 1;
                    error!(
                        server_id,
                        monitor_id = change.monitor_id,
                        to = %change.to_status,
                        error = %e,
                        "Failed to apply status change."
                    );
                }
            }
        }

        let now = Utc::now();
        for monitor in monitors.iter_mut() {
            if monitor.server_status == ServerStatus::Paused {
                if let Err(e) = tx
                    .update_server_score_last_constraint_check(server_id, monitor.id, now)
                    .await
                {
                    error!(server_id, monitor_id = monitor.id, error = %e, "Failed to refresh constraint check.");
                }
                continue;
            }

            // Limits only bind seated monitors; a row that left the committee drops the flag.
            if monitor.violation.kind == ViolationType::Limit && !monitor.server_status.is_counted() {
                monitor.violation = ConstraintViolation::none();
            }

            if let Err(e) = reconcile_violation(&mut tx, server_id, monitor, now).await {
                error!(
                    server_id,
                    monitor_id = monitor.id,
                    error = %e,
                    "Failed to update constraint violation tracking."
                );
            }

            if !monitor.violation.is_violation() {
                continue;
            }
            metrics::record_constraint_violation(server_id, monitor);

            if let Some(reason) = PauseReason::for_violation(monitor.violation.kind) {
                match pause_assignment(&mut tx, server_id, monitor.id, reason).await {
                    Ok(()) => {
                        info!(
                            server_id,
                            monitor_id = monitor.id,
                            from = %monitor.server_status,
                            reason = %reason,
                            details = %monitor.violation.details,
                            "Paused assignment with unchangeable constraint violation."
                        );
                        monitor.server_status = ServerStatus::Paused;
                        monitor.pause_reason = Some(reason);
                        outcome.paused += 1;
                    }
                    Err(e) => {
                        error!(server_id, monitor_id = monitor.id, error = %e, "Failed to pause assignment.");
                    }
                }
            }
        }

        metrics::record_pool(server_id, &monitors);
        metrics::record_change_results(server_id, outcome.applied, outcome.failed);

        if outcome.changed() {
            tx.update_servers_monitor_review_changed(server_id, now + self.intervals.changed)
                .await?;
        } else {
            tx.update_servers_monitor_review(server_id, now + self.intervals.unchanged)
                .await?;
        }
        tx.commit().await?;

        metrics::record_process_duration(server_id, started.elapsed());
        debug!(
            server_id,
            evaluated = outcome.evaluated,
            planned = outcome.planned,
            applied = outcome.applied,
            failed = outcome.failed,
            paused = outcome.paused,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed server."
        );
        Ok(outcome)
    }
}

/// Brings the violation columns of one assignment in line with this pass's verdict.
async fn reconcile_violation<T: SelectorTx>(
    tx: &mut T,
    server_id: i32,
    monitor: &MonitorCandidate,
    now: DateTime<Utc>,
) -> Result<(), SelectorError> {
    let current = monitor.violation.kind;
    match monitor.recorded_violation {
        Some(_) if !current.is_violation() => {
            tx.clear_server_score_constraint_violation(server_id, monitor.id)
                .await?;
        }
        Some((recorded, _)) if recorded == current => {
            tx.update_server_score_last_constraint_check(server_id, monitor.id, now)
                .await?;
        }
        _ if current.is_violation() => {
            tx.update_server_score_constraint_violation(server_id, monitor.id, current, now)
                .await?;
        }
        _ => {}
    }
    Ok(())
}

async fn pause_assignment<T: SelectorTx>(
    tx: &mut T,
    server_id: i32,
    monitor_id: i32,
    reason: PauseReason,
) -> Result<(), SelectorError> {
    tx.update_server_score_status(server_id, monitor_id, ServerStatus::Paused)
        .await?;
    tx.update_server_score_pause_reason(server_id, monitor_id, reason)
        .await?;
    Ok(())
}
