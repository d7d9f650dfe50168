use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{MonitorPriorityRow, Server};
use crate::selector::types::{PauseReason, ServerStatus, ViolationType};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Server not found: {0}")]
    ServerNotFound(i32),
    #[error("Invalid status value: {0}")]
    InvalidStatus(String),
    #[error("Store error: {0}")]
    Other(String),
}

/// Entry point to the store: the review queue and transactions.
#[async_trait]
pub trait SelectorStore: Send + Sync {
    type Tx: SelectorTx;

    /// Ids of servers whose `next_review` is due, oldest first.
    async fn servers_due_for_review(&self, limit: i64) -> Result<Vec<i32>, StoreError>;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// Queries and row mutations the selector runs inside one per-server transaction.
///
/// Dropping a transaction without calling [`SelectorTx::commit`] rolls it back.
#[async_trait]
pub trait SelectorTx: Send {
    /// Loads the server and locks it against concurrent selectors.
    async fn get_server(&mut self, server_id: i32) -> Result<Server, StoreError>;

    /// Every assignment of the server in candidate status or above, paused
    /// included, best priority first.
    async fn get_monitor_priority(
        &mut self,
        server_id: i32,
    ) -> Result<Vec<MonitorPriorityRow>, StoreError>;

    async fn update_server_score_status(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        status: ServerStatus,
    ) -> Result<(), StoreError>;

    async fn update_server_score_constraint_violation(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        violation_type: ViolationType,
        since: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn clear_server_score_constraint_violation(
        &mut self,
        server_id: i32,
        monitor_id: i32,
    ) -> Result<(), StoreError>;

    async fn update_server_score_last_constraint_check(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_server_score_pause_reason(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        reason: PauseReason,
    ) -> Result<(), StoreError>;

    /// Reschedules a server whose committee did not change.
    async fn update_servers_monitor_review(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reschedules a server and stamps its last committee change.
    async fn update_servers_monitor_review_changed(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}
