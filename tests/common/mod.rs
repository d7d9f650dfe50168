#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use monitor_selector::db::models::{MonitorPriorityRow, Server};
use monitor_selector::db::{SelectorStore, SelectorTx, StoreError};
use monitor_selector::selector::types::{PauseReason, ServerStatus, ViolationType};

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Status {
        server_id: i32,
        monitor_id: i32,
        status: ServerStatus,
    },
    Violation {
        server_id: i32,
        monitor_id: i32,
        kind: ViolationType,
        since: DateTime<Utc>,
    },
    ClearViolation {
        server_id: i32,
        monitor_id: i32,
    },
    LastCheck {
        server_id: i32,
        monitor_id: i32,
    },
    PauseReason {
        server_id: i32,
        monitor_id: i32,
        reason: PauseReason,
    },
    Review {
        server_id: i32,
        next_review: DateTime<Utc>,
        changed: bool,
    },
}

#[derive(Debug, Clone, Default)]
struct State {
    servers: BTreeMap<i32, Server>,
    scores: BTreeMap<(i32, i32), MonitorPriorityRow>,
    writes: Vec<Write>,
    fail_status_for: HashSet<i32>,
    fail_queue: bool,
    queue_polls: Vec<tokio::time::Instant>,
}

/// Store double: transactions work on a copy that replaces the shared state on commit.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server that is due for review now.
    pub fn add_server(&self, id: i32, ip: &str, account_id: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        state.servers.insert(
            id,
            Server {
                id,
                ip: ip.to_string(),
                ip_version: if ip.contains(':') { "v6" } else { "v4" }.to_string(),
                account_id,
                next_review: Some(Utc::now() - Duration::minutes(1)),
            },
        );
    }

    pub fn assign(&self, server_id: i32, row: MonitorPriorityRow) {
        let mut state = self.state.lock().unwrap();
        state.scores.insert((server_id, row.id), row);
    }

    pub fn fail_status_updates_for(&self, monitor_id: i32) {
        self.state.lock().unwrap().fail_status_for.insert(monitor_id);
    }

    pub fn fail_queue(&self, fail: bool) {
        self.state.lock().unwrap().fail_queue = fail;
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Status changes committed for `server_id`, in order.
    pub fn status_writes(&self, server_id: i32) -> Vec<(i32, ServerStatus)> {
        self.writes()
            .into_iter()
            .filter_map(|w| match w {
                Write::Status {
                    server_id: s,
                    monitor_id,
                    status,
                } if s == server_id => Some((monitor_id, status)),
                _ => None,
            })
            .collect()
    }

    pub fn status_of(&self, server_id: i32, monitor_id: i32) -> String {
        self.state.lock().unwrap().scores[&(server_id, monitor_id)]
            .status
            .clone()
    }

    pub fn row(&self, server_id: i32, monitor_id: i32) -> MonitorPriorityRow {
        self.state.lock().unwrap().scores[&(server_id, monitor_id)].clone()
    }

    pub fn count_status(&self, server_id: i32, status: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .scores
            .iter()
            .filter(|((s, _), row)| *s == server_id && row.status == status)
            .count()
    }

    pub fn next_review(&self, server_id: i32) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().servers[&server_id].next_review
    }

    /// Seconds since `start` at which the review queue was read.
    pub fn poll_offsets(&self, start: tokio::time::Instant) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .queue_polls
            .iter()
            .map(|at| at.duration_since(start).as_secs())
            .collect()
    }

    /// Makes a server due again without touching anything else.
    pub fn make_due(&self, server_id: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(server) = state.servers.get_mut(&server_id) {
            server.next_review = Some(Utc::now() - Duration::minutes(1));
        }
    }
}

pub struct InMemoryTx {
    shared: Arc<Mutex<State>>,
    working: State,
}

#[async_trait]
impl SelectorStore for InMemoryStore {
    type Tx = InMemoryTx;

    async fn servers_due_for_review(&self, limit: i64) -> Result<Vec<i32>, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.queue_polls.push(tokio::time::Instant::now());
        if state.fail_queue {
            return Err(StoreError::Other("queue unavailable".into()));
        }
        let now = Utc::now();
        let mut due: Vec<&Server> = state
            .servers
            .values()
            .filter(|s| s.next_review.is_some_and(|t| t <= now))
            .collect();
        due.sort_by_key(|s| (s.next_review, s.id));
        Ok(due.into_iter().take(limit as usize).map(|s| s.id).collect())
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let working = self.state.lock().unwrap().clone();
        Ok(InMemoryTx {
            shared: self.state.clone(),
            working,
        })
    }
}

impl InMemoryTx {
    fn score(&mut self, server_id: i32, monitor_id: i32) -> Result<&mut MonitorPriorityRow, StoreError> {
        self.working
            .scores
            .get_mut(&(server_id, monitor_id))
            .ok_or_else(|| StoreError::Other(format!("no score for {server_id}/{monitor_id}")))
    }
}

#[async_trait]
impl SelectorTx for InMemoryTx {
    async fn get_server(&mut self, server_id: i32) -> Result<Server, StoreError> {
        self.working
            .servers
            .get(&server_id)
            .cloned()
            .ok_or(StoreError::ServerNotFound(server_id))
    }

    async fn get_monitor_priority(
        &mut self,
        server_id: i32,
    ) -> Result<Vec<MonitorPriorityRow>, StoreError> {
        let mut rows: Vec<MonitorPriorityRow> = self
            .working
            .scores
            .iter()
            .filter(|((s, _), row)| {
                *s == server_id
                    && matches!(row.status.as_str(), "candidate" | "testing" | "active" | "paused")
            })
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| {
            (a.monitor_priority < 0.0)
                .cmp(&(b.monitor_priority < 0.0))
                .then(a.monitor_priority.total_cmp(&b.monitor_priority))
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn update_server_score_status(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        status: ServerStatus,
    ) -> Result<(), StoreError> {
        if self.working.fail_status_for.contains(&monitor_id) {
            return Err(StoreError::Other(format!("injected failure for {monitor_id}")));
        }
        self.score(server_id, monitor_id)?.status = status.as_str().to_string();
        self.working.writes.push(Write::Status {
            server_id,
            monitor_id,
            status,
        });
        Ok(())
    }

    async fn update_server_score_constraint_violation(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        violation_type: ViolationType,
        since: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = self.score(server_id, monitor_id)?;
        row.constraint_violation_type = Some(violation_type.as_str().to_string());
        row.constraint_violation_since = Some(since);
        row.last_constraint_check = Some(Utc::now());
        self.working.writes.push(Write::Violation {
            server_id,
            monitor_id,
            kind: violation_type,
            since,
        });
        Ok(())
    }

    async fn clear_server_score_constraint_violation(
        &mut self,
        server_id: i32,
        monitor_id: i32,
    ) -> Result<(), StoreError> {
        let row = self.score(server_id, monitor_id)?;
        row.constraint_violation_type = None;
        row.constraint_violation_since = None;
        row.last_constraint_check = Some(Utc::now());
        self.working.writes.push(Write::ClearViolation {
            server_id,
            monitor_id,
        });
        Ok(())
    }

    async fn update_server_score_last_constraint_check(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.score(server_id, monitor_id)?.last_constraint_check = Some(checked_at);
        self.working.writes.push(Write::LastCheck {
            server_id,
            monitor_id,
        });
        Ok(())
    }

    async fn update_server_score_pause_reason(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        reason: PauseReason,
    ) -> Result<(), StoreError> {
        self.score(server_id, monitor_id)?.pause_reason = Some(reason.as_str().to_string());
        self.working.writes.push(Write::PauseReason {
            server_id,
            monitor_id,
            reason,
        });
        Ok(())
    }

    async fn update_servers_monitor_review(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.review(server_id, next_review, false)
    }

    async fn update_servers_monitor_review_changed(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.review(server_id, next_review, true)
    }

    async fn commit(self) -> Result<(), StoreError> {
        *self.shared.lock().unwrap() = self.working;
        Ok(())
    }
}

impl InMemoryTx {
    fn review(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
        changed: bool,
    ) -> Result<(), StoreError> {
        let server = self
            .working
            .servers
            .get_mut(&server_id)
            .ok_or(StoreError::ServerNotFound(server_id))?;
        server.next_review = Some(next_review);
        self.working.writes.push(Write::Review {
            server_id,
            next_review,
            changed,
        });
        Ok(())
    }
}

/// A healthy, globally active candidate owned by account `id`, with priority `id * 10`
/// and its own /16.
pub fn monitor_row(id: i32) -> MonitorPriorityRow {
    MonitorPriorityRow {
        id,
        id_token: Some(format!("tok{id}")),
        tls_name: Some(format!("mon{id}.example.net")),
        ip: Some(format!("10.{}.{}.1", id % 256, id / 256)),
        account_id: Some(id),
        account_flags: None,
        monitor_status: "active".to_string(),
        status: "candidate".to_string(),
        avg_rtt: Some(id as f64),
        monitor_priority: id as f64 * 10.0,
        sample_count: 100,
        healthy: true,
        constraint_violation_type: None,
        constraint_violation_since: None,
        last_constraint_check: None,
        pause_reason: None,
    }
}

pub fn with_status(mut row: MonitorPriorityRow, status: &str) -> MonitorPriorityRow {
    row.status = status.to_string();
    row
}
