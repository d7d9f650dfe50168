//! Fairness rules for placing a monitor on a server.
//!
//! Every check is a pure function over the per-evaluation view. Network checks
//! fail open: an address that cannot be parsed never produces a violation.

use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::warn;

use super::types::{ConstraintViolation, MonitorCandidate, ServerInfo, ServerStatus, ViolationType};

pub const DEFAULT_MONITORS_PER_SERVER_LIMIT: usize = 2;

const SAME_SUBNET_V4_PREFIX: u8 = 24;
const SAME_SUBNET_V6_PREFIX: u8 = 48;
const DIVERSITY_V4_PREFIX: u8 = 20;
const DIVERSITY_V6_PREFIX: u8 = 44;

fn default_monitor_enabled() -> bool {
    true
}

/// The `accounts.flags` JSON blob, as far as the selector cares.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountFlags {
    #[serde(default)]
    pub monitors_per_server_limit: i64,
    #[serde(default = "default_monitor_enabled")]
    pub monitor_enabled: bool,
}

impl Default for AccountFlags {
    fn default() -> Self {
        Self {
            monitors_per_server_limit: 0,
            monitor_enabled: true,
        }
    }
}

impl AccountFlags {
    /// Parses the raw flags. A missing or empty blob yields the defaults.
    pub fn parse(raw: Option<&str>) -> Result<Self, serde_json::Error> {
        match raw.map(str::trim) {
            None | Some("") | Some("null") => Ok(Self::default()),
            Some(json) => serde_json::from_str(json),
        }
    }

    pub fn max_per_server(&self) -> usize {
        if self.monitors_per_server_limit <= 0 {
            DEFAULT_MONITORS_PER_SERVER_LIMIT
        } else {
            self.monitors_per_server_limit as usize
        }
    }
}

/// Per-account cardinality on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountLimit {
    pub account_id: i32,
    pub max_per_server: usize,
    /// Cleared when the account switched monitoring off; no new seats are handed out.
    pub monitor_enabled: bool,
    pub active_count: usize,
    pub testing_count: usize,
}

impl AccountLimit {
    /// Moves one slot of this account from `from` to `to`.
    pub fn record_transition(&mut self, from: ServerStatus, to: ServerStatus) {
        match from {
            ServerStatus::Active => self.active_count = self.active_count.saturating_sub(1),
            ServerStatus::Testing => self.testing_count = self.testing_count.saturating_sub(1),
            _ => {}
        }
        match to {
            ServerStatus::Active => self.active_count += 1,
            ServerStatus::Testing => self.testing_count += 1,
            _ => {}
        }
    }
}

pub type AccountLimits = HashMap<i32, AccountLimit>;

/// Builds the per-account limit table from the monitors assigned to a server.
///
/// Malformed flags are logged once per account and fall back to the defaults.
pub fn build_account_limits(monitors: &[MonitorCandidate]) -> AccountLimits {
    let mut limits = AccountLimits::new();

    for monitor in monitors {
        let Some(account_id) = monitor.account_id else {
            continue;
        };

        let limit = limits.entry(account_id).or_insert_with(|| {
            let flags = AccountFlags::parse(monitor.account_flags.as_deref()).unwrap_or_else(|e| {
                warn!(account_id, error = %e, "Malformed account flags, using defaults.");
                AccountFlags::default()
            });
            AccountLimit {
                account_id,
                max_per_server: flags.max_per_server(),
                monitor_enabled: flags.monitor_enabled,
                active_count: 0,
                testing_count: 0,
            }
        });

        match monitor.server_status {
            ServerStatus::Active => limit.active_count += 1,
            ServerStatus::Testing => limit.testing_count += 1,
            _ => {}
        }
    }

    limits
}

/// Whether two addresses of the same family share a prefix of the
/// family-specific length. `None` when the question cannot be answered.
fn share_prefix(a: &str, b: &str, v4_prefix: u8, v6_prefix: u8) -> Option<bool> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let a: IpAddr = a.parse().ok()?;
    let b: IpAddr = b.parse().ok()?;

    let prefix = match (a, b) {
        (IpAddr::V4(_), IpAddr::V4(_)) => v4_prefix,
        (IpAddr::V6(_), IpAddr::V6(_)) => v6_prefix,
        _ => return None,
    };

    let net = IpNet::new(a, prefix).ok()?.trunc();
    Some(net.contains(&b))
}

pub fn in_same_subnet(a: &str, b: &str) -> bool {
    share_prefix(a, b, SAME_SUBNET_V4_PREFIX, SAME_SUBNET_V6_PREFIX).unwrap_or(false)
}

pub fn in_same_diversity_subnet(a: &str, b: &str) -> bool {
    share_prefix(a, b, DIVERSITY_V4_PREFIX, DIVERSITY_V6_PREFIX).unwrap_or(false)
}

/// Monitor and server must never sit in the same /24 (IPv4) or /48 (IPv6).
pub fn check_network_constraint(monitor_ip: &str, server_ip: &str) -> Option<ConstraintViolation> {
    in_same_subnet(monitor_ip, server_ip).then(|| {
        ConstraintViolation::new(
            ViolationType::NetworkSameSubnet,
            format!("monitor {monitor_ip} is in the same subnet as server {server_ip}"),
        )
    })
}

/// A monitor may not watch a server run by its own account.
pub fn check_account_constraint(
    monitor: &MonitorCandidate,
    server: &ServerInfo,
) -> Option<ConstraintViolation> {
    match (monitor.account_id, server.account_id) {
        (Some(monitor_account), Some(server_account)) if monitor_account == server_account => {
            Some(ConstraintViolation::new(
                ViolationType::Account,
                format!("monitor and server both belong to account {monitor_account}"),
            ))
        }
        _ => None,
    }
}

fn diversity_conflict(target: ServerStatus, existing: ServerStatus) -> bool {
    match target {
        ServerStatus::Active => {
            matches!(existing, ServerStatus::Active | ServerStatus::Testing)
        }
        ServerStatus::Testing => {
            matches!(existing, ServerStatus::Active | ServerStatus::Testing)
        }
        _ => false,
    }
}

/// Two monitors in the same /20 (IPv4) or /44 (IPv6) should not both be on the committee.
pub fn check_network_diversity<'a>(
    candidate: &MonitorCandidate,
    target: ServerStatus,
    others: impl IntoIterator<Item = &'a MonitorCandidate>,
) -> Option<ConstraintViolation> {
    others
        .into_iter()
        .filter(|other| other.id != candidate.id)
        .find(|other| {
            diversity_conflict(target, other.server_status)
                && in_same_diversity_subnet(&candidate.ip, &other.ip)
        })
        .map(|other| {
            ConstraintViolation::new(
                ViolationType::NetworkDiversity,
                format!(
                    "{} monitor {} ({}) shares a network with monitor {} ({})",
                    other.server_status, other.id, other.ip, candidate.id, candidate.ip
                ),
            )
        })
}

/// Per-account cardinality for the target state, not counting the monitor itself.
pub fn check_account_limit(
    monitor: &MonitorCandidate,
    target: ServerStatus,
    limits: &AccountLimits,
) -> Option<ConstraintViolation> {
    let account_id = monitor.account_id?;
    let limit = limits.get(&account_id)?;

    let mut active = limit.active_count;
    let mut testing = limit.testing_count;
    match monitor.server_status {
        ServerStatus::Active => active = active.saturating_sub(1),
        ServerStatus::Testing => testing = testing.saturating_sub(1),
        _ => {}
    }

    let max = limit.max_per_server;
    let within_limit = match target {
        ServerStatus::Active => active < max && active + testing < max + 1,
        ServerStatus::Testing => testing < max + 1 && active + testing < max + 1,
        _ => true,
    };

    (!within_limit).then(|| {
        ConstraintViolation::new(
            ViolationType::Limit,
            format!(
                "account {account_id} limit {max} reached for {target} (active {active}, testing {testing})"
            ),
        )
    })
}

/// Runs every check for placing `monitor` in `target` and returns the first violation found.
pub fn check_constraints(
    monitor: &MonitorCandidate,
    server: &ServerInfo,
    assigned: &[MonitorCandidate],
    target: ServerStatus,
    limits: &AccountLimits,
) -> ConstraintViolation {
    check_network_constraint(&monitor.ip, &server.ip)
        .or_else(|| check_account_constraint(monitor, server))
        .or_else(|| check_account_limit(monitor, target, limits))
        .or_else(|| check_network_diversity(monitor, target, assigned))
        .unwrap_or_else(ConstraintViolation::none)
}

/// Checks an existing assignment in its current state.
///
/// Account limits are left to [`enforce_per_account_limits`], which picks the
/// excess holders deterministically. Diversity is only checked against
/// better-ranked monitors so that of two neighbours the weaker one drains.
pub fn check_existing_assignment(
    monitors: &[MonitorCandidate],
    index: usize,
    server: &ServerInfo,
) -> ConstraintViolation {
    let monitor = &monitors[index];
    check_network_constraint(&monitor.ip, &server.ip)
        .or_else(|| check_account_constraint(monitor, server))
        .or_else(|| check_network_diversity(monitor, monitor.server_status, &monitors[..index]))
        .unwrap_or_else(ConstraintViolation::none)
}

/// Flags the lowest-priority holders of any (account, status) group above its
/// cap with a `limit` violation. Returns the violations keyed by monitor id.
///
/// `monitors` must be in priority order, best first.
pub fn enforce_per_account_limits(
    monitors: &[MonitorCandidate],
    limits: &AccountLimits,
) -> HashMap<i32, ConstraintViolation> {
    let mut flagged = HashMap::new();

    for limit in limits.values() {
        for (status, cap) in [
            (ServerStatus::Active, limit.max_per_server),
            (ServerStatus::Testing, limit.max_per_server + 1),
        ] {
            let holders: Vec<&MonitorCandidate> = monitors
                .iter()
                .filter(|m| m.account_id == Some(limit.account_id) && m.server_status == status)
                .collect();

            if holders.len() <= cap {
                continue;
            }

            for excess in &holders[cap..] {
                flagged.insert(
                    excess.id,
                    ConstraintViolation::new(
                        ViolationType::Limit,
                        format!(
                            "account {} has {} {} monitors, limit is {}",
                            limit.account_id,
                            holders.len(),
                            status,
                            cap
                        ),
                    ),
                );
            }
        }
    }

    flagged
}
