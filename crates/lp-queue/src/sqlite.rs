//! SQLite Task Repository Implementation
//!
//! Timestamps are stored as millisecond epoch integers, statuses as integer
//! codes, and the payload/headers as JSON text.

use crate::repository::{EnqueueOptions, TaskRepository};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lp_common::{TaskStatus, WebhookTask};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

/// SQLite implementation of TaskRepository
pub struct SqliteTaskRepository {
    pool: SqlitePool,
    table: String,
}

impl SqliteTaskRepository {
    /// Create a repository using the default "webhook_tasks" table
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table: "webhook_tasks".to_string(),
        }
    }

    /// Create with a custom table name
    pub fn with_table(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Get the pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<WebhookTask> {
        let created_at_ts: i64 = row.get("created_at");
        let created_at = DateTime::from_timestamp_millis(created_at_ts)
            .ok_or_else(|| anyhow::anyhow!("Invalid created_at timestamp"))?;

        let updated_at: Option<i64> = row.try_get("updated_at").ok();
        let next_retry_at: Option<i64> = row.try_get("next_retry_at").ok().flatten();
        let last_attempt_at: Option<i64> = row.try_get("last_attempt_at").ok().flatten();

        let status_code: i32 = row.get("status");

        Ok(WebhookTask {
            id: row.get("id"),
            event_type: row.get("event_type"),
            payload: serde_json::from_str(row.get("payload"))?,
            target: row.get("target"),
            headers: serde_json::from_str(row.get("headers"))?,
            status: TaskStatus::from_code(status_code),
            retry_count: row.get::<i32, _>("retry_count"),
            max_retries: row.get::<i32, _>("max_retries"),
            next_retry_at: next_retry_at.and_then(DateTime::from_timestamp_millis),
            last_attempt_at: last_attempt_at.and_then(DateTime::from_timestamp_millis),
            error_message: row.try_get("error_message").ok().flatten(),
            created_at,
            updated_at: updated_at.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn enqueue(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        target: &str,
        options: EnqueueOptions,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let query = format!(
            "INSERT INTO {} (id, event_type, payload, target, headers, status, retry_count, max_retries, next_retry_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
            self.table
        );

        sqlx::query(&query)
            .bind(&id)
            .bind(event_type)
            .bind(serde_json::to_string(&payload)?)
            .bind(target)
            .bind(serde_json::to_string(&options.headers)?)
            .bind(TaskStatus::Pending.code())
            .bind(options.max_retries)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        debug!(task_id = %id, event_type = %event_type, "Enqueued webhook task");
        Ok(id)
    }

    async fn fetch_due(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<WebhookTask>> {
        let query = format!(
            "SELECT id, event_type, payload, target, headers, status, retry_count, max_retries, \
                    next_retry_at, last_attempt_at, error_message, created_at, updated_at \
             FROM {} WHERE status = ? AND next_retry_at <= ? ORDER BY next_retry_at ASC LIMIT ?",
            self.table
        );

        let rows = sqlx::query(&query)
            .bind(TaskStatus::Pending.code())
            .bind(now.timestamp_millis())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(self.parse_row(row)?);
        }

        debug!(table = %self.table, count = tasks.len(), "Fetched due tasks");
        Ok(tasks)
    }

    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        // Conditional update: only a pending task can be claimed, so two
        // overlapping sweeps cannot both own the same task.
        let query = format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            self.table
        );

        let result = sqlx::query(&query)
            .bind(TaskStatus::Processing.code())
            .bind(now.timestamp_millis())
            .bind(id)
            .bind(TaskStatus::Pending.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let query = format!(
            "UPDATE {} SET status = ?, error_message = NULL, next_retry_at = NULL, \
                    last_attempt_at = ?, updated_at = ? WHERE id = ?",
            self.table
        );

        sqlx::query(&query)
            .bind(TaskStatus::Success.code())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_failed_rescheduled(
        &self,
        id: &str,
        error: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = format!(
            "UPDATE {} SET status = ?, retry_count = ?, error_message = ?, next_retry_at = ?, \
                    last_attempt_at = ?, updated_at = ? WHERE id = ?",
            self.table
        );

        sqlx::query(&query)
            .bind(TaskStatus::Pending.code())
            .bind(retry_count)
            .bind(error)
            .bind(next_retry_at.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        debug!(task_id = %id, retry_count, "Rescheduled failed task");
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        id: &str,
        error: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = format!(
            "UPDATE {} SET status = ?, retry_count = ?, error_message = ?, next_retry_at = NULL, \
                    last_attempt_at = ?, updated_at = ? WHERE id = ?",
            self.table
        );

        sqlx::query(&query)
            .bind(TaskStatus::DeadLetter.code())
            .bind(retry_count)
            .bind(error)
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        info!(task_id = %id, retry_count, "Task dead-lettered");
        Ok(())
    }

    async fn reset_for_retry(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET status = ?, retry_count = 0, error_message = NULL, next_retry_at = ?, \
                    updated_at = ? WHERE id = ? AND status = ?",
            self.table
        );

        let result = sqlx::query(&query)
            .bind(TaskStatus::Pending.code())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(id)
            .bind(TaskStatus::DeadLetter.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stuck(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now.timestamp_millis() - timeout.as_millis() as i64;

        let query = format!(
            "UPDATE {} SET status = ?, next_retry_at = ?, updated_at = ? \
             WHERE status = ? AND updated_at < ?",
            self.table
        );

        let result = sqlx::query(&query)
            .bind(TaskStatus::Pending.code())
            .bind(now.timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(TaskStatus::Processing.code())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(table = %self.table, count, "Released stuck tasks back to PENDING");
        }
        Ok(count)
    }

    async fn purge_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE status = ? AND updated_at < ?",
            self.table
        );

        let result = sqlx::query(&query)
            .bind(TaskStatus::Success.code())
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &str) -> Result<Option<WebhookTask>> {
        let query = format!(
            "SELECT id, event_type, payload, target, headers, status, retry_count, max_retries, \
                    next_retry_at, last_attempt_at, error_message, created_at, updated_at \
             FROM {} WHERE id = ?",
            self.table
        );

        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.parse_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn init_schema(&self) -> Result<()> {
        let schema = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                target TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '{{}}',
                status INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                next_retry_at INTEGER,
                last_attempt_at INTEGER,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_status_due ON {table}(status, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table}(created_at);
            "#,
            table = self.table,
        );

        sqlx::query(&schema).execute(&self.pool).await?;

        info!(table = %self.table, "Initialized SQLite task schema");
        Ok(())
    }
}
