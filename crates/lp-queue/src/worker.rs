//! Delivery worker: the sweep-based batch runner for webhook tasks.
//!
//! Each sweep fetches a bounded batch of due tasks, claims each one with the
//! conditional pending -> processing guard, runs the external call with a
//! concurrency cap, and applies the shared retry decision. One task's failure
//! never aborts the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lp_common::{AuditRecord, DomainEvent, EventEmitter};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::backoff::{decide, Disposition, RetryPolicy};
use crate::delivery::TaskExecutor;
use crate::repository::TaskRepository;

/// Delivery worker configuration
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    /// Due tasks fetched per sweep
    pub batch_size: u32,
    /// Concurrent deliveries within a sweep
    pub concurrency: usize,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 10,
        }
    }
}

/// Aggregate counters for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Tasks another sweep claimed first
    pub skipped: u64,
    /// Tasks whose state transition could not be persisted
    pub errors: u64,
}

enum ItemResult {
    Succeeded,
    Retried,
    DeadLettered,
    Skipped,
    Error,
}

/// Sweep-based worker processing due webhook tasks.
pub struct DeliveryWorker {
    repository: Arc<dyn TaskRepository>,
    executor: Arc<dyn TaskExecutor>,
    emitter: Arc<dyn EventEmitter>,
    policy: RetryPolicy,
    config: DeliveryWorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        executor: Arc<dyn TaskExecutor>,
        emitter: Arc<dyn EventEmitter>,
        policy: RetryPolicy,
        config: DeliveryWorkerConfig,
    ) -> Self {
        Self {
            repository,
            executor,
            emitter,
            policy,
            config,
        }
    }

    /// Run one sweep for the given time. Safe to invoke from overlapping
    /// schedulers: the claim guard ensures each task is executed at most once.
    pub async fn sweep(&self, now: DateTime<Utc>) -> anyhow::Result<SweepStats> {
        let due = self.repository.fetch_due(self.config.batch_size, now).await?;
        if due.is_empty() {
            return Ok(SweepStats::default());
        }

        debug!(count = due.len(), "Found due webhook tasks");
        metrics::gauge!("webhook.due_tasks").set(due.len() as f64);

        let results: Vec<ItemResult> = stream::iter(due)
            .map(|task| self.process_one(task, now))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut stats = SweepStats::default();
        for result in results {
            match result {
                ItemResult::Succeeded => {
                    stats.processed += 1;
                    stats.succeeded += 1;
                }
                ItemResult::Retried => {
                    stats.processed += 1;
                    stats.retried += 1;
                }
                ItemResult::DeadLettered => {
                    stats.processed += 1;
                    stats.dead_lettered += 1;
                }
                ItemResult::Skipped => stats.skipped += 1,
                ItemResult::Error => {
                    stats.processed += 1;
                    stats.errors += 1;
                }
            }
        }

        metrics::counter!("webhook.sweep.succeeded_total").increment(stats.succeeded);
        metrics::counter!("webhook.sweep.retried_total").increment(stats.retried);
        metrics::counter!("webhook.sweep.dead_lettered_total").increment(stats.dead_lettered);

        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            skipped = stats.skipped,
            "Webhook sweep complete"
        );
        Ok(stats)
    }

    async fn process_one(&self, task: lp_common::WebhookTask, now: DateTime<Utc>) -> ItemResult {
        let claimed = match self.repository.claim(&task.id, now).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to claim task");
                return ItemResult::Error;
            }
        };
        if !claimed {
            debug!(task_id = %task.id, "Task already claimed, skipping");
            return ItemResult::Skipped;
        }

        let outcome = self.executor.execute(&task).await;

        match decide(&outcome, task.retry_count, task.max_retries, &self.policy, now) {
            Disposition::Complete => {
                if let Err(e) = self.repository.mark_succeeded(&task.id, now).await {
                    error!(task_id = %task.id, error = %e, "Failed to mark task succeeded");
                    return ItemResult::Error;
                }
                self.emitter
                    .audit(AuditRecord::new("webhook_task", &task.id, "succeeded", None))
                    .await;
                self.emitter
                    .emit(DomainEvent::new(
                        "webhook.delivered",
                        json!({ "task_id": task.id, "event_type": task.event_type }),
                    ))
                    .await;
                ItemResult::Succeeded
            }
            Disposition::Reschedule {
                retry_count,
                next_retry_at,
            } => {
                let reason = outcome
                    .error_message
                    .unwrap_or_else(|| "Unknown error".to_string());
                if let Err(e) = self
                    .repository
                    .mark_failed_rescheduled(&task.id, &reason, retry_count, next_retry_at, now)
                    .await
                {
                    error!(task_id = %task.id, error = %e, "Failed to reschedule task");
                    return ItemResult::Error;
                }
                warn!(
                    task_id = %task.id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    reason = %reason,
                    "Webhook delivery failed, retry scheduled"
                );
                self.emitter
                    .audit(AuditRecord::new(
                        "webhook_task",
                        &task.id,
                        "rescheduled",
                        Some(reason),
                    ))
                    .await;
                ItemResult::Retried
            }
            Disposition::Exhaust { retry_count } => {
                let reason = outcome
                    .error_message
                    .unwrap_or_else(|| "Unknown error".to_string());
                if let Err(e) = self
                    .repository
                    .mark_dead_letter(&task.id, &reason, retry_count, now)
                    .await
                {
                    error!(task_id = %task.id, error = %e, "Failed to dead-letter task");
                    return ItemResult::Error;
                }
                self.emitter
                    .audit(AuditRecord::new(
                        "webhook_task",
                        &task.id,
                        "dead_lettered",
                        Some(reason.clone()),
                    ))
                    .await;
                self.emitter
                    .emit(DomainEvent::new(
                        "webhook.dead_letter",
                        json!({
                            "task_id": task.id,
                            "event_type": task.event_type,
                            "reason": reason,
                        }),
                    ))
                    .await;
                ItemResult::DeadLettered
            }
        }
    }

    /// Manual recovery of a dead-lettered task: back to pending with a fresh
    /// retry budget, due on the very next sweep. Returns false if the task is
    /// not currently dead-lettered.
    pub async fn retry_dead_letter(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let reset = self.repository.reset_for_retry(id, now).await?;
        if reset {
            info!(task_id = %id, "Dead-lettered task reset for retry");
            self.emitter
                .audit(AuditRecord::new("webhook_task", id, "reset_for_retry", None))
                .await;
        }
        Ok(reset)
    }
}
