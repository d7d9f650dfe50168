use tracing::{debug, info, warn};

use super::eligibility::significantly_outperforms;
use super::SelectionPass;
use crate::selector::types::{CandidateState, MonitorStatus, ServerStatus};

/// Phase A never seeds more than this many candidates per pass.
const MAX_CANDIDATE_PROMOTIONS: usize = 2;

impl SelectionPass<'_> {
    /// Rule 3: fill active seats from the testing pool, best first.
    pub(super) fn apply_rule3_testing_to_active_promotion(&mut self) {
        let reason = if self.emergency_override {
            "emergency promotion to active"
        } else {
            "promotion to active"
        };

        for idx in self.indices(ServerStatus::Testing) {
            if self.counts.active >= self.config.target_active || self.budget.promotions == 0 {
                break;
            }
            if !self.can_promote_to_active(idx) {
                continue;
            }
            self.budget.promotions -= 1;
            self.plan(idx, ServerStatus::Active, reason);
        }
    }

    /// Rule 5: grow the testing pool from candidates, then swap in clearly
    /// better candidates for the weakest testers.
    pub(super) fn apply_rule5_candidate_to_testing_promotion(&mut self) {
        if self.counts.testing == 0 {
            debug!(
                server_id = self.server.id,
                "No testing monitors, leaving seeding to bootstrap."
            );
            return;
        }

        let capacity = self
            .dynamic_testing_target()
            .saturating_sub(self.counts.testing);
        let mut allowed = self
            .budget
            .promotions
            .min(MAX_CANDIDATE_PROMOTIONS)
            .min(capacity);

        let candidates = self.indices(ServerStatus::Candidate);
        let mut ordered = Vec::with_capacity(candidates.len());
        for global in [MonitorStatus::Active, MonitorStatus::Testing] {
            ordered.extend(candidates.iter().copied().filter(|&idx| {
                let m = &self.monitors[idx];
                m.global_status == global && m.recommended_state == CandidateState::In
            }));
        }

        for idx in ordered {
            if allowed == 0 {
                break;
            }
            if !self.can_promote_to_testing(idx, false) {
                continue;
            }
            allowed -= 1;
            self.budget.promotions -= 1;
            self.plan(idx, ServerStatus::Testing, "candidate to testing promotion");
        }

        if self.budget.promotions == 0 || self.counts.testing < self.dynamic_testing_target() {
            return;
        }
        self.apply_performance_replacements();
    }

    /// Replaces the worst eligible testing monitor that a candidate clearly outperforms.
    fn apply_performance_replacements(&mut self) {
        for candidate_idx in self.indices(ServerStatus::Candidate) {
            if self.budget.promotions == 0 || self.budget.testing_removals == 0 {
                break;
            }
            let candidate = &self.monitors[candidate_idx];
            if self.is_touched(candidate_idx)
                || !self.account_enabled(candidate_idx)
                || candidate.recommended_state != CandidateState::In
                || !matches!(
                    candidate.global_status,
                    MonitorStatus::Active | MonitorStatus::Testing
                )
            {
                continue;
            }

            let incumbent = self
                .indices(ServerStatus::Testing)
                .into_iter()
                .rev()
                .find(|&idx| {
                    let m = &self.monitors[idx];
                    !m.violation.is_violation()
                        && !matches!(
                            m.recommended_state,
                            CandidateState::Out | CandidateState::Block
                        )
                });
            let Some(incumbent_idx) = incumbent else {
                return;
            };

            if !significantly_outperforms(
                &self.monitors[candidate_idx],
                &self.monitors[incumbent_idx],
                &self.config,
            ) {
                continue;
            }

            // A swap spends a promotion and a testing removal.
            if self.try_replace(candidate_idx, incumbent_idx) {
                self.budget.promotions -= 1;
                self.budget.testing_removals -= 1;
            }
        }
    }

    /// Checks the candidate as if the incumbent had already left, then plans the swap.
    fn try_replace(&mut self, candidate_idx: usize, incumbent_idx: usize) -> bool {
        let incumbent_account = self.monitors[incumbent_idx].account_id;

        self.monitors[incumbent_idx].server_status = ServerStatus::Candidate;
        if let Some(limit) = incumbent_account.and_then(|id| self.account_limits.get_mut(&id)) {
            limit.record_transition(ServerStatus::Testing, ServerStatus::Candidate);
        }

        let verdict = self.check_for(candidate_idx, ServerStatus::Testing);

        self.monitors[incumbent_idx].server_status = ServerStatus::Testing;
        if let Some(limit) = incumbent_account.and_then(|id| self.account_limits.get_mut(&id)) {
            limit.record_transition(ServerStatus::Candidate, ServerStatus::Testing);
        }

        if verdict.is_violation() {
            debug!(
                server_id = self.server.id,
                candidate = self.monitors[candidate_idx].id,
                incumbent = self.monitors[incumbent_idx].id,
                violation = %verdict.kind,
                "Replacement rejected by constraints."
            );
            return false;
        }

        self.plan(
            incumbent_idx,
            ServerStatus::Candidate,
            "replaced by better candidate",
        );
        self.plan(candidate_idx, ServerStatus::Testing, "replacement promotion");
        true
    }

    /// Rule 6: seed an empty testing pool, healthy candidates first.
    pub(super) fn apply_rule6_bootstrap_promotion(&mut self) {
        if self.counts.testing != 0 {
            return;
        }
        let candidates = self.indices(ServerStatus::Candidate);
        if candidates.is_empty() {
            return;
        }

        let (healthy, others): (Vec<usize>, Vec<usize>) = candidates
            .iter()
            .copied()
            .partition(|&idx| self.monitors[idx].is_healthy);

        let mut promoted = 0;
        for idx in healthy.into_iter().chain(others) {
            if promoted >= self.config.base_testing {
                break;
            }
            if !self.can_promote_to_testing(idx, true) {
                continue;
            }
            let reason = if self.emergency_override {
                format!(
                    "bootstrap emergency promotion: no active monitors, seeding {}",
                    self.monitors[idx].label()
                )
            } else if self.monitors[idx].is_healthy {
                "bootstrap: promoting healthy candidate".to_string()
            } else {
                "bootstrap: promoting candidate".to_string()
            };
            self.plan(idx, ServerStatus::Testing, reason);
            promoted += 1;
        }

        if promoted == 0 {
            warn!(
                server_id = self.server.id,
                candidates = candidates.len(),
                "Bootstrap found no candidate that satisfies constraints."
            );
        } else {
            info!(
                server_id = self.server.id,
                promoted,
                emergency = self.emergency_override,
                "Bootstrapped testing pool."
            );
        }
    }
}
