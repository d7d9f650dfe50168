use tracing::debug;

use super::{RuleConfig, SelectionPass};
use crate::selector::types::{CandidateState, MonitorCandidate, MonitorStatus, ServerStatus};

/// Whether `candidate` is enough of an improvement over `incumbent` to swap them.
///
/// Health decides first. Between equally healthy monitors both priorities
/// must be known and the candidate must clear both the absolute and the
/// relative improvement threshold.
pub fn significantly_outperforms(
    candidate: &MonitorCandidate,
    incumbent: &MonitorCandidate,
    config: &RuleConfig,
) -> bool {
    match (candidate.is_healthy, incumbent.is_healthy) {
        (true, false) => return true,
        (false, true) => return false,
        _ => {}
    }

    if !candidate.has_valid_priority() || !incumbent.has_valid_priority() {
        return false;
    }
    if incumbent.priority <= 0.0 {
        return false;
    }

    let improvement = incumbent.priority - candidate.priority;
    if improvement < config.replacement_min_improvement_points {
        return false;
    }

    improvement / incumbent.priority * 100.0 >= config.replacement_min_improvement_pct
}

impl SelectionPass<'_> {
    pub(super) fn can_promote_to_active(&self, idx: usize) -> bool {
        let monitor = &self.monitors[idx];
        if self.is_touched(idx) || monitor.global_status != MonitorStatus::Active {
            return false;
        }
        match monitor.recommended_state {
            CandidateState::In => {}
            CandidateState::Out if self.emergency_override => {}
            _ => return false,
        }
        if !monitor.passes_health_gate() {
            return false;
        }

        let verdict = self.check_for(idx, ServerStatus::Active);
        if !verdict.is_violation() {
            return true;
        }
        if monitor.violation.is_grandfathered && monitor.violation.kind == verdict.kind {
            return true;
        }
        if self.emergency_override && !verdict.kind.is_unchangeable() {
            debug!(
                server_id = self.server.id,
                monitor_id = monitor.id,
                violation = %verdict.kind,
                "Emergency override bypasses constraint for active promotion."
            );
            return true;
        }

        debug!(
            server_id = self.server.id,
            monitor_id = monitor.id,
            violation = %verdict.kind,
            details = %verdict.details,
            "Not eligible for active."
        );
        false
    }

    pub(super) fn account_enabled(&self, idx: usize) -> bool {
        self.monitors[idx]
            .account_id
            .and_then(|account_id| self.account_limits.get(&account_id))
            .is_none_or(|limit| limit.monitor_enabled)
    }

    /// `allow_override` lets bootstrap promotions use the emergency bypass.
    pub(super) fn can_promote_to_testing(&self, idx: usize, allow_override: bool) -> bool {
        let monitor = &self.monitors[idx];
        if self.is_touched(idx)
            || !matches!(
                monitor.global_status,
                MonitorStatus::Active | MonitorStatus::Testing
            )
            || monitor.recommended_state == CandidateState::Block
        {
            return false;
        }

        if !self.account_enabled(idx) {
            debug!(
                server_id = self.server.id,
                monitor_id = monitor.id,
                account_id = monitor.account_id,
                "Account has monitoring disabled, not eligible for testing."
            );
            return false;
        }

        let verdict = self.check_for(idx, ServerStatus::Testing);
        if !verdict.is_violation() {
            return true;
        }
        if allow_override && self.emergency_override && !verdict.kind.is_unchangeable() {
            debug!(
                server_id = self.server.id,
                monitor_id = monitor.id,
                violation = %verdict.kind,
                "Emergency override bypasses constraint for testing promotion."
            );
            return true;
        }

        debug!(
            server_id = self.server.id,
            monitor_id = monitor.id,
            violation = %verdict.kind,
            details = %verdict.details,
            "Not eligible for testing."
        );
        false
    }
}
