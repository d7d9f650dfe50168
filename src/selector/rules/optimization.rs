use tracing::debug;

use super::SelectionPass;
use crate::selector::types::{CandidateState, MonitorCandidate, ServerStatus};

/// Finds a testing monitor that ranks above an active one, both eligible to stay.
///
/// Returns `(testing_id, active_id)` for the best such tester and the worst
/// active monitor ranked below it. `monitors` must be in priority order.
pub fn find_out_of_order(monitors: &[MonitorCandidate]) -> Option<(i32, i32)> {
    let eligible = |m: &&MonitorCandidate, status: ServerStatus| {
        m.server_status == status && m.recommended_state == CandidateState::In
    };

    let (position, tester) = monitors
        .iter()
        .enumerate()
        .find(|(_, m)| eligible(m, ServerStatus::Testing))?;

    monitors[position + 1..]
        .iter()
        .rev()
        .find(|m| eligible(m, ServerStatus::Active))
        .map(|active| (tester.id, active.id))
}

impl SelectionPass<'_> {
    /// Rule 7: swapping out-of-order pairs is disabled; only the finding is logged.
    pub(super) fn apply_rule7_out_of_order_optimization(&mut self) {
        if let Some((testing_id, active_id)) = find_out_of_order(&self.monitors) {
            debug!(
                server_id = self.server.id,
                testing_id,
                active_id,
                "Testing monitor outranks an active one, swap disabled."
            );
        }
    }
}
