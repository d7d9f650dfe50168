use tracing::debug;

use super::SelectionPass;
use crate::selector::types::{CandidateState, ServerStatus};

impl SelectionPass<'_> {
    /// Rule 1: blocked monitors leave the committee at once.
    pub(super) fn apply_rule1_immediate_blocking(&mut self) {
        let blocked: Vec<usize> = self
            .monitors
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.server_status.is_counted() && m.recommended_state == CandidateState::Block
            })
            .map(|(idx, _)| idx)
            .collect();

        for idx in blocked {
            self.plan(
                idx,
                ServerStatus::Candidate,
                "blocked by constraints or global status",
            );
        }
    }

    /// Rule 2: monitors recommended out step down one level, worst first.
    pub(super) fn apply_rule2_gradual_constraint_removal(&mut self) {
        let active_floor = self.config.target_active.saturating_sub(2);
        let out_active: Vec<usize> = self
            .indices(ServerStatus::Active)
            .into_iter()
            .rev()
            .filter(|&idx| self.monitors[idx].recommended_state == CandidateState::Out)
            .collect();

        for idx in out_active {
            if self.counts.active <= 1 {
                debug!(
                    server_id = self.server.id,
                    monitor_id = self.monitors[idx].id,
                    "Keeping last active monitor."
                );
                break;
            }

            if self.constraint_removals == 0 {
                break;
            }

            let has_violation = self.monitors[idx].violation.is_violation();
            if !has_violation {
                if self.budget.active_removals == 0 {
                    continue;
                }
                if self.counts.active - 1 < active_floor {
                    debug!(
                        server_id = self.server.id,
                        monitor_id = self.monitors[idx].id,
                        active = self.counts.active,
                        "Active removal would breach safety threshold."
                    );
                    continue;
                }
            }

            self.constraint_removals -= 1;
            self.budget.active_removals = self.budget.active_removals.saturating_sub(1);
            let reason = self.removal_reason(idx);
            self.plan(idx, ServerStatus::Testing, reason);
        }

        let out_testing: Vec<usize> = self
            .indices(ServerStatus::Testing)
            .into_iter()
            .rev()
            .filter(|&idx| self.monitors[idx].recommended_state == CandidateState::Out)
            .collect();

        if self.counts.active == 0 {
            // Nothing active to protect: clear out violators only, keep the rest as a pool.
            let violating: Vec<usize> = out_testing
                .into_iter()
                .filter(|&idx| self.monitors[idx].violation.is_violation())
                .collect();
            let allowed = violating.len().min(self.budget.testing_removals);
            for idx in violating.into_iter().take(allowed) {
                self.budget.testing_removals -= 1;
                let reason = self.removal_reason(idx);
                self.plan(idx, ServerStatus::Candidate, reason);
            }
            return;
        }

        for idx in out_testing {
            if self.budget.testing_removals == 0 {
                break;
            }

            let has_violation = self.monitors[idx].violation.is_violation();
            let testing_floor = self.dynamic_testing_target().saturating_sub(2);
            if !has_violation && self.counts.testing.saturating_sub(1) < testing_floor {
                debug!(
                    server_id = self.server.id,
                    monitor_id = self.monitors[idx].id,
                    testing = self.counts.testing,
                    testing_floor,
                    "Testing removal would breach safety threshold."
                );
                continue;
            }

            self.budget.testing_removals -= 1;
            let reason = self.removal_reason(idx);
            self.plan(idx, ServerStatus::Candidate, reason);
        }
    }

    /// Rule 1.5: healthy surplus actives drop to testing, worst first.
    pub(super) fn apply_rule1_5_active_excess_demotion(&mut self) {
        let target = self.config.target_active;
        if self.emergency_override
            || self.counts.active <= target
            || self.counts.active <= 1
            || self.budget.active_removals == 0
        {
            return;
        }

        // Violators still waiting for a removal slot come first.
        let reserved = self
            .indices(ServerStatus::Active)
            .into_iter()
            .filter(|&idx| {
                let m = &self.monitors[idx];
                m.violation.is_violation() && m.recommended_state == CandidateState::Out
            })
            .count();
        let mut remaining = (self.counts.active - target)
            .min(self.budget.active_removals.saturating_sub(reserved));

        let healthy_in: Vec<usize> = self
            .indices(ServerStatus::Active)
            .into_iter()
            .rev()
            .filter(|&idx| {
                let m = &self.monitors[idx];
                m.recommended_state == CandidateState::In && m.passes_health_gate()
            })
            .collect();

        for idx in healthy_in {
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            self.budget.active_removals -= 1;
            self.plan(idx, ServerStatus::Testing, "excess active demotion");
        }
    }

    /// Rule 2.5: shrink an oversized testing pool, worst healthy monitor first.
    pub(super) fn apply_rule2_5_testing_pool_trim(&mut self) {
        let target = self.dynamic_testing_target();
        if self.counts.testing <= target || self.budget.testing_removals == 0 {
            return;
        }

        let trimmable: Vec<usize> = self
            .indices(ServerStatus::Testing)
            .into_iter()
            .rev()
            .filter(|&idx| {
                let m = &self.monitors[idx];
                m.is_healthy
                    && !m.violation.is_violation()
                    && !matches!(
                        m.recommended_state,
                        CandidateState::Out | CandidateState::Block
                    )
            })
            .collect();

        for idx in trimmable {
            if self.counts.testing <= target || self.budget.testing_removals == 0 {
                break;
            }
            self.budget.testing_removals -= 1;
            let reason = format!(
                "testing pool trim: {} testing exceeds target {}",
                self.counts.testing, target
            );
            self.plan(idx, ServerStatus::Candidate, reason);
        }
    }

    fn removal_reason(&self, idx: usize) -> String {
        let m = &self.monitors[idx];
        if m.violation.is_violation() {
            format!("constraint violation: {}", m.violation.kind)
        } else if !m.passes_health_gate() {
            "unhealthy".to_string()
        } else {
            format!("phasing out: global status {}", m.global_status)
        }
    }
}
