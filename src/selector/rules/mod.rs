//! The selection rules.
//!
//! A pass works on a private copy of the server's monitors and account limits.
//! Each rule plans status changes against that copy, so later rules see the
//! effect of earlier ones; nothing is written until the processor applies the
//! returned changes in order. A monitor is changed at most once per pass.

mod eligibility;
mod optimization;
mod promotion;
mod removal;

pub use eligibility::significantly_outperforms;
pub use optimization::find_out_of_order;

use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, error, warn};

use super::constraints::{self, AccountLimits};
use super::types::{
    CandidateState, ConstraintViolation, MonitorCandidate, ServerInfo, ServerStatus, StatusChange,
};

/// Tunables of the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RuleConfig {
    pub target_active: usize,
    pub base_testing: usize,
    /// Relative priority improvement (percent) a candidate needs to replace a testing monitor.
    pub replacement_min_improvement_pct: f64,
    /// Absolute priority improvement a candidate needs to replace a testing monitor.
    pub replacement_min_improvement_points: f64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            target_active: 7,
            base_testing: 5,
            replacement_min_improvement_pct: 20.0,
            replacement_min_improvement_points: 5.0,
        }
    }
}

impl RuleConfig {
    /// The testing pool grows by one for every missing active monitor.
    pub fn dynamic_testing_target(&self, active_count: usize) -> usize {
        self.base_testing + self.target_active.saturating_sub(active_count)
    }
}

/// How many changes of each kind a single pass may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeLimits {
    pub active_removals: usize,
    pub testing_removals: usize,
    pub promotions: usize,
}

impl ChangeLimits {
    pub fn for_pass(blocked_count: usize, active_count: usize) -> Self {
        let base = if active_count == 0 {
            4
        } else if blocked_count > 1 {
            3
        } else {
            2
        };
        Self {
            active_removals: base,
            testing_removals: base,
            promotions: base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkingCounts {
    pub active: usize,
    pub testing: usize,
}

impl WorkingCounts {
    fn of(monitors: &[MonitorCandidate]) -> Self {
        monitors.iter().fold(Self::default(), |mut counts, m| {
            match m.server_status {
                ServerStatus::Active => counts.active += 1,
                ServerStatus::Testing => counts.testing += 1,
                _ => {}
            }
            counts
        })
    }

    fn record_transition(&mut self, from: ServerStatus, to: ServerStatus) {
        match from {
            ServerStatus::Active => self.active = self.active.saturating_sub(1),
            ServerStatus::Testing => self.testing = self.testing.saturating_sub(1),
            _ => {}
        }
        match to {
            ServerStatus::Active => self.active += 1,
            ServerStatus::Testing => self.testing += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionOutcome {
    pub changes: Vec<StatusChange>,
    pub emergency_override: bool,
    pub initial_counts: WorkingCounts,
    pub final_counts: WorkingCounts,
}

pub struct RuleEngine {
    config: RuleConfig,
}

impl RuleEngine {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    /// Plans the status changes for one server.
    ///
    /// `monitors` must be in priority order (best first) and already carry
    /// their constraint verdict and recommended state. Rows that are not
    /// candidate, testing or active are ignored.
    pub fn select(
        &self,
        server: &ServerInfo,
        monitors: &[MonitorCandidate],
        account_limits: &AccountLimits,
    ) -> SelectionOutcome {
        let working: Vec<MonitorCandidate> = monitors
            .iter()
            .filter(|m| {
                matches!(
                    m.server_status,
                    ServerStatus::Active | ServerStatus::Testing | ServerStatus::Candidate
                )
            })
            .cloned()
            .collect();

        let counts = WorkingCounts::of(&working);
        let target = self.config.target_active;
        let emergency_override = counts.active == 0;

        let blocked = working
            .iter()
            .filter(|m| {
                m.server_status.is_counted() && m.recommended_state == CandidateState::Block
            })
            .count();
        let healthy_active = working
            .iter()
            .filter(|m| m.server_status == ServerStatus::Active && m.is_healthy)
            .count();
        let healthy_testing = working
            .iter()
            .filter(|m| m.server_status == ServerStatus::Testing && m.is_healthy)
            .count();
        let has_violations = working.iter().any(|m| m.violation.is_violation());

        let mut budget = ChangeLimits::for_pass(blocked, counts.active);
        // Violators keep their removal slots when the safety floor suspends the rest.
        let constraint_removals = budget
            .active_removals
            .min(counts.active.saturating_sub(1));

        debug!(
            server_id = server.id,
            active = counts.active,
            testing = counts.testing,
            candidates = working.len() - counts.active - counts.testing,
            healthy_active,
            healthy_testing,
            blocked,
            "Starting selection."
        );

        if counts.active <= target.saturating_sub(2) && healthy_active < target {
            if budget.active_removals > 0 {
                warn!(
                    server_id = server.id,
                    active = counts.active,
                    healthy_active,
                    target_active = target,
                    "Active monitors at or below safety threshold, suspending performance removals."
                );
            }
            budget.active_removals = 0;
        }
        budget.active_removals = budget
            .active_removals
            .min(counts.active.saturating_sub(1));

        if emergency_override {
            warn!(
                server_id = server.id,
                testing = counts.testing,
                candidates = working.len() - counts.testing,
                "No active monitors, emergency override engaged for promotions."
            );
        } else if target > working.len()
            && healthy_active == 0
            && healthy_testing == 0
            && !has_violations
        {
            warn!(
                server_id = server.id,
                total = working.len(),
                "No healthy monitors and too few to reach target, leaving assignments unchanged."
            );
            return SelectionOutcome {
                changes: Vec::new(),
                emergency_override,
                initial_counts: counts,
                final_counts: counts,
            };
        }

        let mut pass = SelectionPass {
            config: self.config,
            server,
            monitors: working,
            account_limits: account_limits.clone(),
            counts,
            budget,
            constraint_removals,
            emergency_override,
            touched: HashSet::new(),
            changes: Vec::new(),
        };

        pass.apply_rule1_immediate_blocking();
        pass.apply_rule2_gradual_constraint_removal();
        pass.apply_rule1_5_active_excess_demotion();
        pass.apply_rule3_testing_to_active_promotion();
        pass.apply_rule5_candidate_to_testing_promotion();
        pass.apply_rule2_5_testing_pool_trim();
        pass.apply_rule6_bootstrap_promotion();
        pass.apply_rule7_out_of_order_optimization();
        pass.validate_final_counts();

        SelectionOutcome {
            changes: pass.changes,
            emergency_override,
            initial_counts: counts,
            final_counts: pass.counts,
        }
    }
}

/// Mutable state of one selection pass.
pub(super) struct SelectionPass<'a> {
    config: RuleConfig,
    server: &'a ServerInfo,
    monitors: Vec<MonitorCandidate>,
    account_limits: AccountLimits,
    counts: WorkingCounts,
    budget: ChangeLimits,
    /// Active removals left for constraint violators.
    constraint_removals: usize,
    emergency_override: bool,
    touched: HashSet<i32>,
    changes: Vec<StatusChange>,
}

impl SelectionPass<'_> {
    /// Untouched monitors currently in `status`, best first.
    fn indices(&self, status: ServerStatus) -> Vec<usize> {
        self.monitors
            .iter()
            .enumerate()
            .filter(|(_, m)| m.server_status == status && !self.touched.contains(&m.id))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn is_touched(&self, idx: usize) -> bool {
        self.touched.contains(&self.monitors[idx].id)
    }

    fn dynamic_testing_target(&self) -> usize {
        self.config.dynamic_testing_target(self.counts.active)
    }

    fn check_for(&self, idx: usize, target: ServerStatus) -> ConstraintViolation {
        constraints::check_constraints(
            &self.monitors[idx],
            self.server,
            &self.monitors,
            target,
            &self.account_limits,
        )
    }

    /// Moves the working copy of one monitor to `to` and records the change.
    fn plan(&mut self, idx: usize, to: ServerStatus, reason: impl Into<String>) {
        let monitor = &mut self.monitors[idx];
        let from = monitor.server_status;
        let reason = reason.into();

        if let Some(limit) = monitor
            .account_id
            .and_then(|account_id| self.account_limits.get_mut(&account_id))
        {
            limit.record_transition(from, to);
        }
        self.counts.record_transition(from, to);
        monitor.server_status = to;
        self.touched.insert(monitor.id);

        debug!(
            server_id = self.server.id,
            monitor_id = monitor.id,
            from = %from,
            to = %to,
            reason = %reason,
            "Planned status change."
        );
        self.changes
            .push(StatusChange::new(monitor.id, from, to, reason));
    }

    fn validate_final_counts(&self) {
        let target_testing = self.dynamic_testing_target();
        if self.counts.active > self.config.target_active || self.counts.testing > target_testing {
            error!(
                critical = true,
                server_id = self.server.id,
                active = self.counts.active,
                testing = self.counts.testing,
                target_active = self.config.target_active,
                target_testing,
                "Final monitor counts exceed targets."
            );
        }
    }
}
