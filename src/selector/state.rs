use tracing::warn;

use super::types::{CandidateState, MonitorCandidate, MonitorStatus, ServerStatus};

fn holds_assignment(status: ServerStatus) -> bool {
    matches!(
        status,
        ServerStatus::Active | ServerStatus::Testing | ServerStatus::Candidate
    )
}

/// Recommends a disposition for `monitor` on the server under review.
///
/// Expects `monitor.violation` to be filled in (including its
/// `is_grandfathered` flag) before it is called.
pub fn classify(monitor: &MonitorCandidate, server_id: i32) -> CandidateState {
    match monitor.global_status {
        MonitorStatus::Pending => {
            if holds_assignment(monitor.server_status) {
                warn!(
                    server_id,
                    monitor_id = monitor.id,
                    server_status = %monitor.server_status,
                    "Globally pending monitor holds an assignment."
                );
            }
            return CandidateState::Out;
        }
        MonitorStatus::Paused | MonitorStatus::Deleted => {
            if holds_assignment(monitor.server_status) {
                warn!(
                    server_id,
                    monitor_id = monitor.id,
                    global_status = %monitor.global_status,
                    server_status = %monitor.server_status,
                    "Inconsistent global and server status, blocking."
                );
            }
            return CandidateState::Block;
        }
        MonitorStatus::Testing | MonitorStatus::Active => {}
    }

    if monitor.violation.is_violation() {
        if monitor.violation.is_grandfathered {
            return CandidateState::Out;
        }
        return match monitor.server_status {
            ServerStatus::New => CandidateState::Block,
            _ => CandidateState::Out,
        };
    }

    if monitor.has_metrics && !monitor.is_healthy {
        return CandidateState::Out;
    }

    if monitor.server_status == ServerStatus::Testing
        && monitor.global_status == MonitorStatus::Testing
    {
        return CandidateState::Pending;
    }

    CandidateState::In
}
