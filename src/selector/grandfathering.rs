use super::types::{ConstraintViolation, MonitorCandidate, ServerStatus, ViolationType};

/// Whether an existing violation is tolerated, letting the monitor drift out
/// gradually instead of being removed in this pass.
///
/// Only assignments that already hold a committee seat (active or testing)
/// can be grandfathered. Hard network and account rules never are.
pub fn is_grandfathered(monitor: &MonitorCandidate, violation: &ConstraintViolation) -> bool {
    if !matches!(monitor.server_status, ServerStatus::Active | ServerStatus::Testing) {
        return false;
    }

    match violation.kind {
        ViolationType::Limit | ViolationType::NetworkDiversity => true,
        ViolationType::NetworkSameSubnet | ViolationType::Account | ViolationType::None => false,
    }
}
