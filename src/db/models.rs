use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An NTP server in the pool.
/// Corresponds to the `servers` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: i32,
    pub ip: String,
    pub ip_version: String, // "v4" or "v6"
    pub account_id: Option<i32>,
    pub next_review: Option<DateTime<Utc>>,
}

/// One monitor assigned to a server, joined with its account and recent telemetry.
/// Produced by the monitor priority query; rows arrive best priority first.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MonitorPriorityRow {
    pub id: i32,
    pub id_token: Option<String>,
    pub tls_name: Option<String>,
    pub ip: Option<String>,
    pub account_id: Option<i32>,
    pub account_flags: Option<String>, // raw JSON from accounts.flags
    pub monitor_status: String,
    pub status: String, // server_scores.status
    pub avg_rtt: Option<f64>,
    pub monitor_priority: f64,
    pub sample_count: i64,
    pub healthy: bool,
    pub constraint_violation_type: Option<String>,
    pub constraint_violation_since: Option<DateTime<Utc>>,
    pub last_constraint_check: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
}
