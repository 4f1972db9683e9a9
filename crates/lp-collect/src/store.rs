//! Persistence boundary for the collection engine.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::{CollectionSchedule, Invoice, Payment, PaymentMandate};

/// Storage for schedules, mandates, invoices and payments.
///
/// Every mutating method takes an explicit `now` so sweeps are replayable
/// in tests without touching the wall clock.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    // --- schedules ---

    async fn create_schedule(&self, schedule: &CollectionSchedule) -> anyhow::Result<()>;

    async fn get_schedule(&self, id: &str) -> anyhow::Result<Option<CollectionSchedule>>;

    /// Active schedules whose collection day matches `today` and that have no
    /// retry in flight. A `collection_day` past the end of the month matches
    /// the month's last day.
    async fn first_attempts_due(
        &self,
        today: NaiveDate,
        limit: u32,
    ) -> anyhow::Result<Vec<CollectionSchedule>>;

    /// Active schedules with a scheduled retry that has come due.
    async fn retries_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<CollectionSchedule>>;

    /// Clear retry state after a successful (or already-settled) collection.
    async fn reset_retry_state(&self, schedule_id: &str, now: DateTime<Utc>)
        -> anyhow::Result<()>;

    /// Record a retryable failure: bump the count and park the schedule until
    /// `next_retry_at`.
    async fn advance_retry_state(
        &self,
        schedule_id: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Stop the schedule after its final failure. The retry timestamp is
    /// cleared; only `reactivate_schedule` brings it back.
    async fn stop_schedule(
        &self,
        schedule_id: &str,
        retry_count: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Manual operator action: put a STOPPED schedule back in rotation with a
    /// clean retry state. Returns false if the schedule was not stopped.
    async fn reactivate_schedule(&self, schedule_id: &str, now: DateTime<Utc>)
        -> anyhow::Result<bool>;

    // --- mandates ---

    async fn create_mandate(&self, mandate: &PaymentMandate) -> anyhow::Result<()>;

    async fn get_mandate(&self, id: &str) -> anyhow::Result<Option<PaymentMandate>>;

    // --- invoices ---

    async fn create_invoice(&self, invoice: &Invoice) -> anyhow::Result<()>;

    /// The non-cancelled invoice for (lease, period), if one exists.
    async fn find_invoice(&self, lease_id: &str, period: &str)
        -> anyhow::Result<Option<Invoice>>;

    /// The most recently issued unpaid (SENT or LATE) invoice for a lease.
    /// Used to recover the billing period a retry chain belongs to.
    async fn find_open_invoice(&self, lease_id: &str) -> anyhow::Result<Option<Invoice>>;

    async fn mark_invoice_paid(&self, invoice_id: &str, now: DateTime<Utc>)
        -> anyhow::Result<()>;

    async fn mark_invoice_late(&self, invoice_id: &str, now: DateTime<Utc>)
        -> anyhow::Result<()>;

    // --- payments ---

    async fn record_payment(&self, payment: &Payment) -> anyhow::Result<()>;

    async fn payments_for_invoice(&self, invoice_id: &str) -> anyhow::Result<Vec<Payment>>;
}
