//! Builders shared by the selector unit tests.

use super::constraints::build_account_limits;
use super::process::evaluate_monitors;
use super::types::{
    CandidateState, ConstraintViolation, MonitorCandidate, MonitorStatus, ServerInfo,
    ServerStatus, ViolationType,
};

pub(crate) struct MonitorBuilder {
    inner: MonitorCandidate,
}

/// A healthy, globally active candidate with a unique /16 and priority `id * 10`.
pub(crate) fn monitor(id: i32) -> MonitorBuilder {
    MonitorBuilder {
        inner: MonitorCandidate {
            id,
            id_token: format!("mon{id}"),
            tls_name: format!("mon{id}.test"),
            ip: format!("10.{}.{}.1", id % 256, id / 256),
            account_id: None,
            account_flags: None,
            global_status: MonitorStatus::Active,
            server_status: ServerStatus::Candidate,
            has_metrics: true,
            is_healthy: true,
            rtt: id as f64,
            priority: id as f64 * 10.0,
            count: 100,
            recorded_violation: None,
            last_constraint_check: None,
            pause_reason: None,
            violation: ConstraintViolation::none(),
            recommended_state: CandidateState::Unknown,
        },
    }
}

impl MonitorBuilder {
    pub(crate) fn ip(mut self, ip: &str) -> Self {
        self.inner.ip = ip.to_string();
        self
    }

    pub(crate) fn account(mut self, account_id: i32) -> Self {
        self.inner.account_id = Some(account_id);
        self
    }

    pub(crate) fn flags(mut self, flags: &str) -> Self {
        self.inner.account_flags = Some(flags.to_string());
        self
    }

    pub(crate) fn status(mut self, status: ServerStatus) -> Self {
        self.inner.server_status = status;
        self
    }

    pub(crate) fn global(mut self, status: MonitorStatus) -> Self {
        self.inner.global_status = status;
        self
    }

    pub(crate) fn unhealthy(mut self) -> Self {
        self.inner.is_healthy = false;
        self
    }

    pub(crate) fn no_metrics(mut self) -> Self {
        self.inner.has_metrics = false;
        self.inner.count = 0;
        self.inner.priority = -1.0;
        self
    }

    pub(crate) fn priority(mut self, priority: f64) -> Self {
        self.inner.priority = priority;
        self
    }

    pub(crate) fn rtt(mut self, rtt: f64) -> Self {
        self.inner.rtt = rtt;
        self
    }

    pub(crate) fn state(mut self, state: CandidateState) -> Self {
        self.inner.recommended_state = state;
        self
    }

    pub(crate) fn violation(mut self, kind: ViolationType, grandfathered: bool) -> Self {
        self.inner.violation = ConstraintViolation {
            is_grandfathered: grandfathered,
            ..ConstraintViolation::new(kind, "test")
        };
        self
    }

    pub(crate) fn build(self) -> MonitorCandidate {
        self.inner
    }
}

pub(crate) fn server(account_id: Option<i32>) -> ServerInfo {
    ServerInfo {
        id: 1,
        ip: "192.0.2.1".to_string(),
        ip_version: "v4".to_string(),
        account_id,
    }
}

/// Fills in violations and recommended states the way a review does.
pub(crate) fn prepare(mut monitors: Vec<MonitorCandidate>, server: &ServerInfo) -> Vec<MonitorCandidate> {
    let limits = build_account_limits(&monitors);
    evaluate_monitors(&mut monitors, server, &limits);
    monitors
}
