//! The collection sweep, run once per day by the cron binary.
//!
//! Phase 1 starts first attempts for schedules whose collection day is today;
//! phase 2 re-attempts schedules whose scheduled retry has come due. Item
//! failures are isolated: one broken schedule never aborts the sweep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lp_common::{AuditRecord, DomainEvent, EventEmitter, ExecutionOutcome};
use lp_queue::{decide, Disposition, RetryPolicy};
use serde_json::json;
use tracing::{error, info, warn};

use crate::gateway::PaymentGateway;
use crate::reconciler::{CollectionOutcome, Reconciler};
use crate::store::CollectionStore;
use crate::{BillingPeriod, CollectionSchedule};

#[derive(Debug, Clone)]
pub struct CollectionRunnerConfig {
    /// Max schedules fetched per phase per run.
    pub batch_size: u32,
}

impl Default for CollectionRunnerConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub processed: u64,
    pub collected: u64,
    pub already_paid: u64,
    pub retried: u64,
    pub stopped: u64,
    pub errors: u64,
}

enum ItemResult {
    Collected,
    AlreadyPaid,
    Retried,
    Stopped,
    Error,
}

impl RunStats {
    fn record(&mut self, result: ItemResult) {
        self.processed += 1;
        match result {
            ItemResult::Collected => self.collected += 1,
            ItemResult::AlreadyPaid => self.already_paid += 1,
            ItemResult::Retried => self.retried += 1,
            ItemResult::Stopped => self.stopped += 1,
            ItemResult::Error => self.errors += 1,
        }
    }
}

/// Drives rent collection across all schedules.
pub struct CollectionRunner {
    store: Arc<dyn CollectionStore>,
    reconciler: Reconciler,
    emitter: Arc<dyn EventEmitter>,
    policy: RetryPolicy,
    config: CollectionRunnerConfig,
}

impl CollectionRunner {
    pub fn new(
        store: Arc<dyn CollectionStore>,
        gateway: Arc<dyn PaymentGateway>,
        emitter: Arc<dyn EventEmitter>,
        policy: RetryPolicy,
        config: CollectionRunnerConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), gateway),
            store,
            emitter,
            policy,
            config,
        }
    }

    /// One full sweep at the given instant. `now` is injected so tests can
    /// step through days without sleeping.
    pub async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<RunStats> {
        let today = now.date_naive();
        let current_period = BillingPeriod::from_date(today);
        let mut stats = RunStats::default();

        // Phase 1: first attempts for today's collection day
        let due = self
            .store
            .first_attempts_due(today, self.config.batch_size)
            .await?;
        for schedule in &due {
            let result = self.process_one(schedule, current_period, now).await;
            stats.record(result);
        }

        // Phase 2: scheduled re-attempts that have come due
        let retries = self.store.retries_due(now, self.config.batch_size).await?;
        for schedule in &retries {
            let period = self.retry_period(schedule, current_period).await;
            let result = self.process_one(schedule, period, now).await;
            stats.record(result);
        }

        metrics::counter!("collection.collected_total").increment(stats.collected);
        metrics::counter!("collection.retried_total").increment(stats.retried);
        metrics::counter!("collection.stopped_total").increment(stats.stopped);
        metrics::counter!("collection.errors_total").increment(stats.errors);

        info!(
            processed = stats.processed,
            collected = stats.collected,
            already_paid = stats.already_paid,
            retried = stats.retried,
            stopped = stats.stopped,
            errors = stats.errors,
            "Collection sweep complete"
        );
        Ok(stats)
    }

    /// Manual operator action: put a stopped schedule back in rotation.
    pub async fn resume_schedule(&self, schedule_id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let resumed = self.store.reactivate_schedule(schedule_id, now).await?;
        if resumed {
            self.emitter
                .audit(AuditRecord::new(
                    "collection_schedule",
                    schedule_id,
                    "reactivated",
                    None,
                ))
                .await;
            info!(schedule_id = %schedule_id, "Schedule reactivated");
        }
        Ok(resumed)
    }

    /// A retry belongs to the period of the invoice it is trying to settle,
    /// which may differ from the current month when the cadence crosses a
    /// month boundary. Fall back to the current period if no invoice was
    /// created before the first failure.
    async fn retry_period(
        &self,
        schedule: &CollectionSchedule,
        current: BillingPeriod,
    ) -> BillingPeriod {
        match self.store.find_open_invoice(&schedule.lease_id).await {
            Ok(Some(invoice)) => invoice.period.parse().unwrap_or(current),
            Ok(None) => current,
            Err(e) => {
                warn!(lease_id = %schedule.lease_id, error = %e, "Open invoice lookup failed");
                current
            }
        }
    }

    async fn process_one(
        &self,
        schedule: &CollectionSchedule,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> ItemResult {
        match self.reconciler.collect(schedule, &period, now).await {
            Ok(CollectionOutcome::Collected {
                invoice_id,
                payment_id,
            }) => self.on_collected(schedule, &period, &invoice_id, &payment_id, now).await,
            Ok(CollectionOutcome::AlreadyPaid { invoice_id }) => {
                if let Err(e) = self.store.reset_retry_state(&schedule.id, now).await {
                    error!(schedule_id = %schedule.id, error = %e, "Failed to reset retry state");
                    return ItemResult::Error;
                }
                self.emitter
                    .audit(AuditRecord::new(
                        "collection_schedule",
                        &schedule.id,
                        "already_paid",
                        Some(format!("invoice={}", invoice_id)),
                    ))
                    .await;
                ItemResult::AlreadyPaid
            }
            Ok(CollectionOutcome::Failed {
                invoice_id,
                reason,
                retryable,
            }) => {
                self.on_failed(schedule, &period, invoice_id, &reason, retryable, now)
                    .await
            }
            Err(e) => {
                error!(
                    schedule_id = %schedule.id,
                    lease_id = %schedule.lease_id,
                    error = %e,
                    "Collection attempt errored"
                );
                ItemResult::Error
            }
        }
    }

    async fn on_collected(
        &self,
        schedule: &CollectionSchedule,
        period: &BillingPeriod,
        invoice_id: &str,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> ItemResult {
        if let Err(e) = self.store.reset_retry_state(&schedule.id, now).await {
            error!(schedule_id = %schedule.id, error = %e, "Failed to reset retry state");
            return ItemResult::Error;
        }

        self.emitter
            .audit(AuditRecord::new(
                "collection_schedule",
                &schedule.id,
                "collected",
                Some(format!("invoice={} payment={}", invoice_id, payment_id)),
            ))
            .await;
        self.emitter
            .emit(DomainEvent::new(
                "payment.collected",
                json!({
                    "lease_id": schedule.lease_id,
                    "tenant_id": schedule.tenant_id,
                    "owner_id": schedule.owner_id,
                    "invoice_id": invoice_id,
                    "period": period.key(),
                    "amount": schedule.total_amount(),
                    "currency": schedule.currency,
                }),
            ))
            .await;

        ItemResult::Collected
    }

    async fn on_failed(
        &self,
        schedule: &CollectionSchedule,
        period: &BillingPeriod,
        invoice_id: Option<String>,
        reason: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> ItemResult {
        let outcome = if retryable {
            ExecutionOutcome::transient(None, reason)
        } else {
            ExecutionOutcome::permanent(None, reason)
        };

        match decide(
            &outcome,
            schedule.retry_count,
            schedule.max_retries,
            &self.policy,
            now,
        ) {
            Disposition::Reschedule {
                retry_count,
                next_retry_at,
            } => {
                if let Err(e) = self
                    .store
                    .advance_retry_state(&schedule.id, retry_count, next_retry_at, reason, now)
                    .await
                {
                    error!(schedule_id = %schedule.id, error = %e, "Failed to advance retry state");
                    return ItemResult::Error;
                }

                self.emitter
                    .audit(AuditRecord::new(
                        "collection_schedule",
                        &schedule.id,
                        "retry_scheduled",
                        Some(format!("attempt={} reason={}", retry_count, reason)),
                    ))
                    .await;
                self.emitter
                    .emit(DomainEvent::new(
                        "payment.failed.retry_scheduled",
                        json!({
                            "lease_id": schedule.lease_id,
                            "tenant_id": schedule.tenant_id,
                            "invoice_id": invoice_id,
                            "period": period.key(),
                            "reason": reason,
                            "retry_count": retry_count,
                            "next_retry_at": next_retry_at.to_rfc3339(),
                        }),
                    ))
                    .await;

                ItemResult::Retried
            }
            Disposition::Exhaust { retry_count } => {
                if let Err(e) = self
                    .store
                    .stop_schedule(&schedule.id, retry_count, reason, now)
                    .await
                {
                    error!(schedule_id = %schedule.id, error = %e, "Failed to stop schedule");
                    return ItemResult::Error;
                }
                if let Some(invoice_id) = &invoice_id {
                    if let Err(e) = self.store.mark_invoice_late(invoice_id, now).await {
                        warn!(invoice_id = %invoice_id, error = %e, "Failed to mark invoice late");
                    }
                }

                self.emitter
                    .audit(AuditRecord::new(
                        "collection_schedule",
                        &schedule.id,
                        "stopped",
                        Some(format!("attempt={} reason={}", retry_count, reason)),
                    ))
                    .await;
                self.emitter
                    .emit(DomainEvent::new(
                        "payment.failed.final",
                        json!({
                            "lease_id": schedule.lease_id,
                            "tenant_id": schedule.tenant_id,
                            "owner_id": schedule.owner_id,
                            "invoice_id": invoice_id,
                            "period": period.key(),
                            "reason": reason,
                            "retry_count": retry_count,
                        }),
                    ))
                    .await;

                ItemResult::Stopped
            }
            Disposition::Complete => {
                // decide() never completes a failed outcome
                warn!(schedule_id = %schedule.id, "Unexpected complete disposition for a failure");
                ItemResult::Error
            }
        }
    }
}
