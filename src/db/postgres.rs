use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use super::models::{MonitorPriorityRow, Server};
use super::store::{SelectorStore, SelectorTx, StoreError};
use crate::selector::types::{PauseReason, ServerStatus, ViolationType};

const MONITOR_PRIORITY_QUERY: &str = r#"
    WITH recent AS (
        SELECT ls.monitor_id,
               AVG(ls.rtt)::float8 / 1000.0 AS avg_rtt,
               AVG(ls.step)::float8 AS avg_step,
               COUNT(*) AS sample_count
        FROM log_scores ls
        WHERE ls.server_id = $1
          AND ls.monitor_id IS NOT NULL
          AND ls.ts > now() - interval '24 hours'
        GROUP BY ls.monitor_id
    )
    SELECT * FROM (
    SELECT m.id,
           m.id_token,
           m.tls_name,
           m.ip,
           m.account_id,
           a.flags::text AS account_flags,
           m.status AS monitor_status,
           ss.status AS status,
           r.avg_rtt,
           COALESCE(ROUND((r.avg_rtt * (1 + 2 * (1 - r.avg_step)))::numeric)::float8, -1) AS monitor_priority,
           COALESCE(r.sample_count, 0) AS sample_count,
           COALESCE(r.avg_step > 0, false) AS healthy,
           ss.constraint_violation_type,
           ss.constraint_violation_since,
           ss.last_constraint_check,
           ss.pause_reason
    FROM server_scores ss
    INNER JOIN monitors m ON m.id = ss.monitor_id
    LEFT JOIN accounts a ON a.id = m.account_id
    LEFT JOIN recent r ON r.monitor_id = m.id
    WHERE ss.server_id = $1
      AND m.type = 'monitor'
      AND ss.status IN ('candidate', 'testing', 'active', 'paused')
    ) q
    ORDER BY q.monitor_priority < 0, q.monitor_priority, q.id
"#;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgSelectorStore {
    db_pool: PgPool,
}

impl PgSelectorStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let db_pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "Connected to database.");
        Ok(Self::new(db_pool))
    }
}

#[async_trait]
impl SelectorStore for PgSelectorStore {
    type Tx = PgSelectorTx;

    async fn servers_due_for_review(&self, limit: i64) -> Result<Vec<i32>, StoreError> {
        let ids = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT id FROM servers
            WHERE next_review <= now() AND deletion_on IS NULL
            ORDER BY next_review
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;
        Ok(ids)
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.db_pool.begin().await?;
        Ok(PgSelectorTx { tx })
    }
}

pub struct PgSelectorTx {
    tx: Transaction<'static, Postgres>,
}

impl PgSelectorTx {
    async fn execute_score_update(
        &mut self,
        sql: &str,
        server_id: i32,
        monitor_id: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(sql)
            .bind(server_id)
            .bind(monitor_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SelectorTx for PgSelectorTx {
    async fn get_server(&mut self, server_id: i32) -> Result<Server, StoreError> {
        sqlx::query_as::<_, Server>(
            "SELECT id, ip, ip_version, account_id, next_review FROM servers WHERE id = $1 FOR UPDATE",
        )
        .bind(server_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or(StoreError::ServerNotFound(server_id))
    }

    async fn get_monitor_priority(
        &mut self,
        server_id: i32,
    ) -> Result<Vec<MonitorPriorityRow>, StoreError> {
        let rows = sqlx::query_as::<_, MonitorPriorityRow>(MONITOR_PRIORITY_QUERY)
            .bind(server_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn update_server_score_status(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        status: ServerStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE server_scores SET status = $3, modified_on = now() WHERE server_id = $1 AND monitor_id = $2",
        )
        .bind(server_id)
        .bind(monitor_id)
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_server_score_constraint_violation(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        violation_type: ViolationType,
        since: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE server_scores
            SET constraint_violation_type = $3, constraint_violation_since = $4, last_constraint_check = now()
            WHERE server_id = $1 AND monitor_id = $2
            "#,
        )
        .bind(server_id)
        .bind(monitor_id)
        .bind(violation_type.as_str())
        .bind(since)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn clear_server_score_constraint_violation(
        &mut self,
        server_id: i32,
        monitor_id: i32,
    ) -> Result<(), StoreError> {
        self.execute_score_update(
            r#"
            UPDATE server_scores
            SET constraint_violation_type = NULL, constraint_violation_since = NULL, last_constraint_check = now()
            WHERE server_id = $1 AND monitor_id = $2
            "#,
            server_id,
            monitor_id,
        )
        .await
    }

    async fn update_server_score_last_constraint_check(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE server_scores SET last_constraint_check = $3 WHERE server_id = $1 AND monitor_id = $2",
        )
        .bind(server_id)
        .bind(monitor_id)
        .bind(checked_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_server_score_pause_reason(
        &mut self,
        server_id: i32,
        monitor_id: i32,
        reason: PauseReason,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE server_scores SET pause_reason = $3 WHERE server_id = $1 AND monitor_id = $2",
        )
        .bind(server_id)
        .bind(monitor_id)
        .bind(reason.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_servers_monitor_review(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE servers SET next_review = $2 WHERE id = $1")
            .bind(server_id)
            .bind(next_review)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_servers_monitor_review_changed(
        &mut self,
        server_id: i32,
        next_review: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE servers SET next_review = $2, last_change = now() WHERE id = $1")
            .bind(server_id)
            .bind(next_review)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
