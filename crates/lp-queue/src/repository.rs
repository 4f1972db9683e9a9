//! Task Repository Trait
//!
//! Persistence contract for the retryable task queue. All writes are
//! single-row updates; tasks are processed independently, so no cross-row
//! transactions are needed. The one concurrency-sensitive operation is
//! `claim`: it must transition pending -> processing conditionally so that
//! overlapping sweeps cannot double-process the same task.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use lp_common::WebhookTask;
use std::collections::HashMap;
use std::time::Duration;

/// Options for enqueueing a new task
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub max_retries: i32,
    pub headers: HashMap<String, String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            headers: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a pending task due immediately. Returns the task id.
    async fn enqueue(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        target: &str,
        options: EnqueueOptions,
    ) -> Result<String>;

    /// Fetch pending tasks with `next_retry_at <= now`, ordered by
    /// `next_retry_at` ascending.
    async fn fetch_due(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<WebhookTask>>;

    /// Conditionally transition pending -> processing. Returns false when the
    /// task was already claimed (by an overlapping sweep) or moved on.
    async fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Terminal success: clears error state and any scheduled retry.
    async fn mark_succeeded(&self, id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Retryable failure with budget left: back to pending with the new
    /// retry count and a future due time.
    async fn mark_failed_rescheduled(
        &self,
        id: &str,
        error: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Terminal failure: retry budget exhausted or the error is not
    /// retryable. Requires manual intervention via `reset_for_retry`.
    async fn mark_dead_letter(
        &self,
        id: &str,
        error: &str,
        retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Manual recovery: dead_letter -> pending with retry_count 0, due now.
    /// Returns false if the task is not currently dead-lettered.
    async fn reset_for_retry(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Reset tasks stuck in processing for longer than `timeout` back to
    /// pending. Returns the number of tasks released.
    async fn release_stuck(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64>;

    /// Delete successful task records older than `older_than`.
    async fn purge_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Fetch a single task by id.
    async fn get(&self, id: &str) -> Result<Option<WebhookTask>>;

    /// Initialize schema (create tables if not exists)
    async fn init_schema(&self) -> Result<()>;
}
