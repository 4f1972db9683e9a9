//! SQLite-backed audit log and event outbox.
//!
//! Both tables are append-only: one audit row per meaningful transition, one
//! outbox row per outbound domain event. A separate notification dispatcher
//! drains the outbox. Emission is best-effort; failures are logged and never
//! propagated to the caller.

use async_trait::async_trait;
use lp_common::{AuditRecord, DomainEvent, EventEmitter};
use sqlx::SqlitePool;
use tracing::{info, warn};

/// EventEmitter writing to `audit_log` and `outbox_events` tables.
pub struct SqliteEventLog {
    pool: SqlitePool,
}

impl SqliteEventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT,
                recorded_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id);
            CREATE TABLE IF NOT EXISTS outbox_events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                processed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_events_unprocessed ON outbox_events(processed_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Initialized audit/outbox schema");
        Ok(())
    }

    /// Number of unprocessed outbox events, for monitoring.
    pub async fn pending_events(&self) -> anyhow::Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox_events WHERE processed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }
}

#[async_trait]
impl EventEmitter for SqliteEventLog {
    async fn emit(&self, event: DomainEvent) {
        let payload = match serde_json::to_string(&event.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "Dropping unserializable event");
                return;
            }
        };

        let result = sqlx::query(
            "INSERT INTO outbox_events (id, event_type, payload, occurred_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(payload)
        .bind(event.occurred_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(event_type = %event.event_type, error = %e, "Failed to write outbox event");
        }
    }

    async fn audit(&self, record: AuditRecord) {
        let result = sqlx::query(
            "INSERT INTO audit_log (id, entity_type, entity_id, action, detail, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.action)
        .bind(&record.detail)
        .bind(record.recorded_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(entity_id = %record.entity_id, error = %e, "Failed to write audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_log() -> SqliteEventLog {
        // Single connection so the in-memory database is shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let log = SqliteEventLog::new(pool);
        log.init_schema().await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_emit_appends_outbox_row() {
        let log = memory_log().await;
        log.emit(DomainEvent::new("payment.collected", json!({"lease_id": "l-1"})))
            .await;
        log.emit(DomainEvent::new("payment.failed.final", json!({"lease_id": "l-2"})))
            .await;

        assert_eq!(log.pending_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_audit_never_fails_caller() {
        let log = memory_log().await;
        // Dropping the table makes every insert fail; audit must swallow it.
        sqlx::query("DROP TABLE audit_log")
            .execute(&log.pool)
            .await
            .unwrap();

        log.audit(AuditRecord::new("webhook_task", "t-1", "succeeded", None))
            .await;
    }
}
