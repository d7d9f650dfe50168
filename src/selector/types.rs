use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::models::{MonitorPriorityRow, Server};
use crate::db::store::StoreError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Status of a single (server, monitor) assignment, the `server_scores.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    New,
    Candidate,
    Testing,
    Active,
    Paused,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::New => "new",
            ServerStatus::Candidate => "candidate",
            ServerStatus::Testing => "testing",
            ServerStatus::Active => "active",
            ServerStatus::Paused => "paused",
        }
    }

    /// Active and testing assignments count against account limits.
    pub fn is_counted(&self) -> bool {
        matches!(self, ServerStatus::Active | ServerStatus::Testing)
    }
}

impl FromStr for ServerStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ServerStatus::New),
            "candidate" => Ok(ServerStatus::Candidate),
            "testing" => Ok(ServerStatus::Testing),
            "active" => Ok(ServerStatus::Active),
            "paused" => Ok(ServerStatus::Paused),
            other => Err(ParseEnumError::new("server status", other)),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Global status of a monitor, independent of any server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Pending,
    Testing,
    Active,
    Paused,
    Deleted,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Pending => "pending",
            MonitorStatus::Testing => "testing",
            MonitorStatus::Active => "active",
            MonitorStatus::Paused => "paused",
            MonitorStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for MonitorStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MonitorStatus::Pending),
            "testing" => Ok(MonitorStatus::Testing),
            "active" => Ok(MonitorStatus::Active),
            "paused" => Ok(MonitorStatus::Paused),
            "deleted" => Ok(MonitorStatus::Deleted),
            other => Err(ParseEnumError::new("monitor status", other)),
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    #[default]
    None,
    NetworkSameSubnet,
    NetworkDiversity,
    Account,
    Limit,
}

impl ViolationType {
    /// Every kind that counts as a violation.
    pub const VIOLATIONS: [ViolationType; 4] = [
        ViolationType::NetworkSameSubnet,
        ViolationType::NetworkDiversity,
        ViolationType::Account,
        ViolationType::Limit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::None => "none",
            ViolationType::NetworkSameSubnet => "network_same_subnet",
            ViolationType::NetworkDiversity => "network_diversity",
            ViolationType::Account => "account",
            ViolationType::Limit => "limit",
        }
    }

    pub fn is_violation(&self) -> bool {
        !matches!(self, ViolationType::None)
    }

    /// Hard rules that no amount of waiting will fix. Assignments carrying
    /// one of these are paused instead of drained.
    pub fn is_unchangeable(&self) -> bool {
        matches!(self, ViolationType::NetworkSameSubnet | ViolationType::Account)
    }
}

impl FromStr for ViolationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "none" => Ok(ViolationType::None),
            "network_same_subnet" => Ok(ViolationType::NetworkSameSubnet),
            "network_diversity" => Ok(ViolationType::NetworkDiversity),
            "account" => Ok(ViolationType::Account),
            "limit" => Ok(ViolationType::Limit),
            other => Err(ParseEnumError::new("constraint violation type", other)),
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recommended disposition for a monitor on one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CandidateState {
    #[default]
    Unknown,
    /// Eligible to stay or be promoted.
    In,
    /// Remove gradually.
    Out,
    /// Remove immediately.
    Block,
    /// Stay where it is; cannot move up yet.
    Pending,
}

impl CandidateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateState::Unknown => "unknown",
            CandidateState::In => "in",
            CandidateState::Out => "out",
            CandidateState::Block => "block",
            CandidateState::Pending => "pending",
        }
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    NetworkConflict,
    AccountConflict,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::NetworkConflict => "network_conflict",
            PauseReason::AccountConflict => "account_conflict",
        }
    }

    pub fn for_violation(kind: ViolationType) -> Option<Self> {
        match kind {
            ViolationType::NetworkSameSubnet => Some(PauseReason::NetworkConflict),
            ViolationType::Account => Some(PauseReason::AccountConflict),
            _ => None,
        }
    }
}

impl FromStr for PauseReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network_conflict" => Ok(PauseReason::NetworkConflict),
            "account_conflict" => Ok(PauseReason::AccountConflict),
            other => Err(ParseEnumError::new("pause reason", other)),
        }
    }
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintViolation {
    pub kind: ViolationType,
    pub details: String,
    pub since: Option<DateTime<Utc>>,
    pub is_grandfathered: bool,
}

impl ConstraintViolation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(kind: ViolationType, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
            since: None,
            is_grandfathered: false,
        }
    }

    pub fn is_violation(&self) -> bool {
        self.kind.is_violation()
    }
}

/// The server under review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: i32,
    pub ip: String,
    pub ip_version: String,
    pub account_id: Option<i32>,
}

impl From<Server> for ServerInfo {
    fn from(server: Server) -> Self {
        Self {
            id: server.id,
            ip: server.ip,
            ip_version: server.ip_version,
            account_id: server.account_id,
        }
    }
}

/// Per-evaluation view of one monitor assigned to the server under review.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorCandidate {
    pub id: i32,
    pub id_token: String,
    pub tls_name: String,
    pub ip: String,
    pub account_id: Option<i32>,
    pub account_flags: Option<String>,
    pub global_status: MonitorStatus,
    pub server_status: ServerStatus,
    pub has_metrics: bool,
    pub is_healthy: bool,
    pub rtt: f64,
    /// Lower is better; negative means no usable score.
    pub priority: f64,
    pub count: i64,
    /// Violation stored on the assignment row before this pass.
    pub recorded_violation: Option<(ViolationType, DateTime<Utc>)>,
    pub last_constraint_check: Option<DateTime<Utc>>,
    pub pause_reason: Option<PauseReason>,
    /// Verdict of this pass.
    pub violation: ConstraintViolation,
    pub recommended_state: CandidateState,
}

impl MonitorCandidate {
    pub fn has_valid_priority(&self) -> bool {
        self.priority >= 0.0
    }

    /// Health gate for promotions: monitors without telemetry are not held back.
    pub fn passes_health_gate(&self) -> bool {
        !self.has_metrics || self.is_healthy
    }

    pub fn label(&self) -> &str {
        if self.tls_name.is_empty() {
            &self.id_token
        } else {
            &self.tls_name
        }
    }
}

impl TryFrom<MonitorPriorityRow> for MonitorCandidate {
    type Error = StoreError;

    fn try_from(row: MonitorPriorityRow) -> Result<Self, Self::Error> {
        let global_status = row
            .monitor_status
            .parse::<MonitorStatus>()
            .map_err(|e| StoreError::InvalidStatus(e.to_string()))?;
        let server_status = row
            .status
            .parse::<ServerStatus>()
            .map_err(|e| StoreError::InvalidStatus(e.to_string()))?;

        let recorded_violation = match (
            row.constraint_violation_type.as_deref(),
            row.constraint_violation_since,
        ) {
            (Some(kind), Some(since)) => {
                let kind = kind
                    .parse::<ViolationType>()
                    .map_err(|e| StoreError::InvalidStatus(e.to_string()))?;
                kind.is_violation().then_some((kind, since))
            }
            _ => None,
        };

        // Unknown pause reasons are not fatal; the row simply reads as having none.
        let pause_reason = row
            .pause_reason
            .as_deref()
            .and_then(|r| r.parse::<PauseReason>().ok());

        Ok(MonitorCandidate {
            id: row.id,
            id_token: row.id_token.unwrap_or_default(),
            tls_name: row.tls_name.unwrap_or_default(),
            ip: row.ip.unwrap_or_default(),
            account_id: row.account_id,
            account_flags: row.account_flags,
            global_status,
            server_status,
            has_metrics: row.sample_count > 0,
            is_healthy: row.healthy,
            rtt: row.avg_rtt.unwrap_or_default(),
            priority: row.monitor_priority,
            count: row.sample_count,
            recorded_violation,
            last_constraint_check: row.last_constraint_check,
            pause_reason,
            violation: ConstraintViolation::none(),
            recommended_state: CandidateState::Unknown,
        })
    }
}

/// A planned transition produced by the rule engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub monitor_id: i32,
    pub from_status: ServerStatus,
    pub to_status: ServerStatus,
    pub reason: String,
}

impl StatusChange {
    pub fn new(
        monitor_id: i32,
        from_status: ServerStatus,
        to_status: ServerStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            monitor_id,
            from_status,
            to_status,
            reason: reason.into(),
        }
    }
}
