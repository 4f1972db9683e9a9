use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod logging;

// ============================================================================
// Task Types
// ============================================================================

/// Task status codes stored as integers in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be processed, or rescheduled for a future retry (code: 0)
    Pending,
    /// Delivered/charged successfully (code: 1)
    Success,
    /// Last attempt failed; superseded by Pending once rescheduled (code: 2)
    Failed,
    /// Retry budget exhausted, needs manual intervention (code: 3)
    DeadLetter,
    /// Claimed by a worker, call in flight (code: 9)
    Processing,
}

impl TaskStatus {
    /// Convert status to integer code for database storage
    pub fn code(&self) -> i32 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Success => 1,
            TaskStatus::Failed => 2,
            TaskStatus::DeadLetter => 3,
            TaskStatus::Processing => 9,
        }
    }

    /// Create status from integer code, defaulting to Pending for unknown codes
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => TaskStatus::Success,
            2 => TaskStatus::Failed,
            3 => TaskStatus::DeadLetter,
            9 => TaskStatus::Processing,
            _ => TaskStatus::Pending,
        }
    }

    /// Terminal states never leave the table on their own; DeadLetter only
    /// via an explicit manual reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::DeadLetter)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Success => write!(f, "SUCCESS"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::DeadLetter => write!(f, "DEAD_LETTER"),
            TaskStatus::Processing => write!(f, "PROCESSING"),
        }
    }
}

/// A durable queue item: one outbound webhook delivery with its retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTask {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Event type, e.g. "lease.signed" or "payment.collected"
    pub event_type: String,
    /// JSON payload delivered as the POST body
    pub payload: serde_json::Value,
    /// Target endpoint URL
    pub target: String,
    /// Extra request headers (name -> value)
    pub headers: HashMap<String, String>,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Non-null only while a retry is scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error message from the last failed attempt
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// External Call Outcome
// ============================================================================

/// Result of one side-effecting external call (webhook POST or gateway
/// charge). Executors never return Err; every failure mode collapses into
/// this struct so the caller owns all state transitions.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    /// Whether a failure is worth retrying. 4xx validation/auth errors are
    /// not; timeouts, connection errors and 5xx are.
    pub retryable: bool,
}

impl ExecutionOutcome {
    pub fn success(status_code: Option<u16>) -> Self {
        Self {
            success: true,
            status_code,
            error_message: None,
            retryable: false,
        }
    }

    pub fn transient(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            error_message: Some(message.into()),
            retryable: true,
        }
    }

    pub fn permanent(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            error_message: Some(message.into()),
            retryable: false,
        }
    }
}

// ============================================================================
// Audit / Outbox Events
// ============================================================================

/// An outbound domain event, drained later by a separate notification
/// dispatcher. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    /// e.g. "payment.collected", "webhook.dead_letter"
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// An immutable audit trail entry recording one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    /// e.g. "webhook_task", "collection_schedule", "invoice"
    pub entity_type: String,
    pub entity_id: String,
    /// e.g. "claimed", "succeeded", "rescheduled", "dead_lettered"
    pub action: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: action.into(),
            detail,
            recorded_at: Utc::now(),
        }
    }
}

/// Best-effort sink for audit records and outbound events.
///
/// Implementations must swallow their own failures (log and continue).
/// Emission is never part of the correctness-critical path and must not
/// block or fail a task transition.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: DomainEvent);
    async fn audit(&self, record: AuditRecord);
}

/// Emitter that drops everything. Useful in tests and one-off tools.
pub struct NoopEmitter;

#[async_trait]
impl EventEmitter for NoopEmitter {
    async fn emit(&self, _event: DomainEvent) {}
    async fn audit(&self, _record: AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::DeadLetter,
            TaskStatus::Processing,
        ] {
            assert_eq!(TaskStatus::from_code(status.code()), status);
        }
    }

    #[test]
    fn test_unknown_code_defaults_to_pending() {
        assert_eq!(TaskStatus::from_code(42), TaskStatus::Pending);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::DeadLetter.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_outcome_constructors() {
        let ok = ExecutionOutcome::success(Some(200));
        assert!(ok.success);
        assert!(!ok.retryable);

        let transient = ExecutionOutcome::transient(Some(503), "upstream down");
        assert!(!transient.success);
        assert!(transient.retryable);

        let permanent = ExecutionOutcome::permanent(Some(400), "bad payload");
        assert!(!permanent.success);
        assert!(!permanent.retryable);
    }
}
