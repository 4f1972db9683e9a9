//! SQLite Collection Store Implementation
//!
//! Timestamps are stored as millisecond epoch integers, statuses as TEXT,
//! amounts as integer minor units. A partial unique index guarantees at most
//! one non-cancelled invoice per (lease, period).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::store::CollectionStore;
use crate::{
    CollectionSchedule, Invoice, InvoiceStatus, MandateStatus, Payment, PaymentMandate,
    PaymentStatus, ScheduleStatus,
};

const SCHEDULE_COLUMNS: &str = "id, lease_id, tenant_id, owner_id, mandate_id, collection_day, \
     rent_amount, charges_amount, currency, status, retry_count, max_retries, \
     last_failure_reason, next_retry_at, last_attempt_at, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, lease_id, period, rent_amount, charges_amount, total_amount, \
     currency, status, issued_at, paid_at";

/// SQLite implementation of CollectionStore
pub struct SqliteCollectionStore {
    pool: SqlitePool,
}

impl SqliteCollectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_schedules (
                id TEXT PRIMARY KEY,
                lease_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                mandate_id TEXT NOT NULL,
                collection_day INTEGER NOT NULL,
                rent_amount INTEGER NOT NULL,
                charges_amount INTEGER NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'EUR',
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                last_failure_reason TEXT,
                next_retry_at INTEGER,
                last_attempt_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_status_day
                ON collection_schedules(status, collection_day);
            CREATE INDEX IF NOT EXISTS idx_schedules_retry_due
                ON collection_schedules(status, next_retry_at);

            CREATE TABLE IF NOT EXISTS payment_mandates (
                id TEXT PRIMARY KEY,
                lease_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                customer_ref TEXT NOT NULL,
                payment_method_ref TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mandates_lease ON payment_mandates(lease_id);

            CREATE TABLE IF NOT EXISTS invoices (
                id TEXT PRIMARY KEY,
                lease_id TEXT NOT NULL,
                period TEXT NOT NULL,
                rent_amount INTEGER NOT NULL,
                charges_amount INTEGER NOT NULL DEFAULT 0,
                total_amount INTEGER NOT NULL,
                currency TEXT NOT NULL DEFAULT 'EUR',
                status TEXT NOT NULL DEFAULT 'SENT',
                issued_at INTEGER NOT NULL,
                paid_at INTEGER
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_invoices_lease_period
                ON invoices(lease_id, period) WHERE status != 'CANCELLED';

            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                invoice_id TEXT NOT NULL,
                gateway_ref TEXT,
                amount INTEGER NOT NULL,
                currency TEXT NOT NULL DEFAULT 'EUR',
                status TEXT NOT NULL,
                error_message TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_invoice ON payments(invoice_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Initialized SQLite collection schema");
        Ok(())
    }

    fn parse_schedule(&self, row: &sqlx::sqlite::SqliteRow) -> Result<CollectionSchedule> {
        let created_at_ts: i64 = row.get("created_at");
        let created_at = DateTime::from_timestamp_millis(created_at_ts)
            .ok_or_else(|| anyhow::anyhow!("Invalid created_at timestamp"))?;

        let updated_at: Option<i64> = row.try_get("updated_at").ok().flatten();
        let next_retry_at: Option<i64> = row.try_get("next_retry_at").ok().flatten();
        let last_attempt_at: Option<i64> = row.try_get("last_attempt_at").ok().flatten();
        let status: String = row.get("status");

        Ok(CollectionSchedule {
            id: row.get("id"),
            lease_id: row.get("lease_id"),
            tenant_id: row.get("tenant_id"),
            owner_id: row.get("owner_id"),
            mandate_id: row.get("mandate_id"),
            collection_day: row.get::<i64, _>("collection_day") as u32,
            rent_amount: row.get("rent_amount"),
            charges_amount: row.get("charges_amount"),
            currency: row.get("currency"),
            status: ScheduleStatus::from(status.as_str()),
            retry_count: row.get::<i32, _>("retry_count"),
            max_retries: row.get::<i32, _>("max_retries"),
            last_failure_reason: row.try_get("last_failure_reason").ok().flatten(),
            next_retry_at: next_retry_at.and_then(DateTime::from_timestamp_millis),
            last_attempt_at: last_attempt_at.and_then(DateTime::from_timestamp_millis),
            created_at,
            updated_at: updated_at.and_then(DateTime::from_timestamp_millis),
        })
    }

    fn parse_invoice(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Invoice> {
        let issued_at_ts: i64 = row.get("issued_at");
        let issued_at = DateTime::from_timestamp_millis(issued_at_ts)
            .ok_or_else(|| anyhow::anyhow!("Invalid issued_at timestamp"))?;
        let paid_at: Option<i64> = row.try_get("paid_at").ok().flatten();
        let status: String = row.get("status");

        Ok(Invoice {
            id: row.get("id"),
            lease_id: row.get("lease_id"),
            period: row.get("period"),
            rent_amount: row.get("rent_amount"),
            charges_amount: row.get("charges_amount"),
            total_amount: row.get("total_amount"),
            currency: row.get("currency"),
            status: InvoiceStatus::from(status.as_str()),
            issued_at,
            paid_at: paid_at.and_then(DateTime::from_timestamp_millis),
        })
    }

    fn parse_payment(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Payment> {
        let created_at_ts: i64 = row.get("created_at");
        let created_at = DateTime::from_timestamp_millis(created_at_ts)
            .ok_or_else(|| anyhow::anyhow!("Invalid created_at timestamp"))?;
        let status: String = row.get("status");

        Ok(Payment {
            id: row.get("id"),
            invoice_id: row.get("invoice_id"),
            gateway_ref: row.try_get("gateway_ref").ok().flatten(),
            amount: row.get("amount"),
            currency: row.get("currency"),
            status: PaymentStatus::from(status.as_str()),
            error_message: row.try_get("error_message").ok().flatten(),
            created_at,
        })
    }
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (next_year, next_month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .map(|first| first.pred_opt().map(|d| d.day()).unwrap_or(28))
        .unwrap_or(28)
}

#[async_trait]
impl CollectionStore for SqliteCollectionStore {
    async fn create_schedule(&self, schedule: &CollectionSchedule) -> Result<()> {
        sqlx::query(
            "INSERT INTO collection_schedules \
             (id, lease_id, tenant_id, owner_id, mandate_id, collection_day, rent_amount, \
              charges_amount, currency, status, retry_count, max_retries, last_failure_reason, \
              next_retry_at, last_attempt_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&schedule.id)
        .bind(&schedule.lease_id)
        .bind(&schedule.tenant_id)
        .bind(&schedule.owner_id)
        .bind(&schedule.mandate_id)
        .bind(schedule.collection_day as i64)
        .bind(schedule.rent_amount)
        .bind(schedule.charges_amount)
        .bind(&schedule.currency)
        .bind(schedule.status.as_str())
        .bind(schedule.retry_count)
        .bind(schedule.max_retries)
        .bind(&schedule.last_failure_reason)
        .bind(schedule.next_retry_at.map(|t| t.timestamp_millis()))
        .bind(schedule.last_attempt_at.map(|t| t.timestamp_millis()))
        .bind(schedule.created_at.timestamp_millis())
        .bind(schedule.updated_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        debug!(schedule_id = %schedule.id, lease_id = %schedule.lease_id, "Created collection schedule");
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<CollectionSchedule>> {
        let query = format!(
            "SELECT {} FROM collection_schedules WHERE id = ?",
            SCHEDULE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.parse_schedule(&row)?)),
            None => Ok(None),
        }
    }

    async fn first_attempts_due(
        &self,
        today: NaiveDate,
        limit: u32,
    ) -> Result<Vec<CollectionSchedule>> {
        let last_day = last_day_of_month(today);
        // On the last day of the month, also catch schedules whose day
        // doesn't exist this month (e.g. day 31 in February).
        let query = format!(
            "SELECT {} FROM collection_schedules \
             WHERE status = ? AND retry_count = 0 AND next_retry_at IS NULL \
               AND (collection_day = ? OR (? = ? AND collection_day > ?)) \
             ORDER BY created_at ASC LIMIT ?",
            SCHEDULE_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(ScheduleStatus::Active.as_str())
            .bind(today.day() as i64)
            .bind(today.day() as i64)
            .bind(last_day as i64)
            .bind(last_day as i64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            schedules.push(self.parse_schedule(row)?);
        }

        debug!(day = today.day(), count = schedules.len(), "Fetched first attempts due");
        Ok(schedules)
    }

    async fn retries_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<CollectionSchedule>> {
        let query = format!(
            "SELECT {} FROM collection_schedules \
             WHERE status = ? AND next_retry_at IS NOT NULL AND next_retry_at <= ? \
               AND retry_count > 0 AND retry_count < max_retries \
             ORDER BY next_retry_at ASC LIMIT ?",
            SCHEDULE_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(ScheduleStatus::Active.as_str())
            .bind(now.timestamp_millis())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut schedules = Vec::with_capacity(rows.len());
        for row in &rows {
            schedules.push(self.parse_schedule(row)?);
        }

        debug!(count = schedules.len(), "Fetched due retries");
        Ok(schedules)
    }

    async fn reset_retry_state(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE collection_schedules \
             SET retry_count = 0, next_retry_at = NULL, last_failure_reason = NULL, \
                 last_attempt_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn advance_retry_state(
        &self,
        schedule_id: &str,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE collection_schedules \
             SET retry_count = ?, next_retry_at = ?, last_failure_reason = ?, \
                 last_attempt_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(retry_count)
        .bind(next_retry_at.timestamp_millis())
        .bind(reason)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;

        debug!(schedule_id = %schedule_id, retry_count, "Rescheduled failed collection");
        Ok(())
    }

    async fn stop_schedule(
        &self,
        schedule_id: &str,
        retry_count: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE collection_schedules \
             SET status = ?, retry_count = ?, next_retry_at = NULL, last_failure_reason = ?, \
                 last_attempt_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(ScheduleStatus::Stopped.as_str())
        .bind(retry_count)
        .bind(reason)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;

        info!(schedule_id = %schedule_id, retry_count, reason = %reason, "Collection schedule stopped");
        Ok(())
    }

    async fn reactivate_schedule(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE collection_schedules \
             SET status = ?, retry_count = 0, next_retry_at = NULL, last_failure_reason = NULL, \
                 updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(ScheduleStatus::Active.as_str())
        .bind(now.timestamp_millis())
        .bind(schedule_id)
        .bind(ScheduleStatus::Stopped.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn create_mandate(&self, mandate: &PaymentMandate) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_mandates \
             (id, lease_id, tenant_id, owner_id, customer_ref, payment_method_ref, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&mandate.id)
        .bind(&mandate.lease_id)
        .bind(&mandate.tenant_id)
        .bind(&mandate.owner_id)
        .bind(&mandate.customer_ref)
        .bind(&mandate.payment_method_ref)
        .bind(mandate.status.as_str())
        .bind(mandate.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_mandate(&self, id: &str) -> Result<Option<PaymentMandate>> {
        let row = sqlx::query(
            "SELECT id, lease_id, tenant_id, owner_id, customer_ref, payment_method_ref, \
                    status, created_at \
             FROM payment_mandates WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let created_at_ts: i64 = row.get("created_at");
        let status: String = row.get("status");
        Ok(Some(PaymentMandate {
            id: row.get("id"),
            lease_id: row.get("lease_id"),
            tenant_id: row.get("tenant_id"),
            owner_id: row.get("owner_id"),
            customer_ref: row.get("customer_ref"),
            payment_method_ref: row.get("payment_method_ref"),
            status: MandateStatus::from(status.as_str()),
            created_at: DateTime::from_timestamp_millis(created_at_ts)
                .ok_or_else(|| anyhow::anyhow!("Invalid created_at timestamp"))?,
        }))
    }

    async fn create_invoice(&self, invoice: &Invoice) -> Result<()> {
        sqlx::query(
            "INSERT INTO invoices \
             (id, lease_id, period, rent_amount, charges_amount, total_amount, currency, \
              status, issued_at, paid_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&invoice.id)
        .bind(&invoice.lease_id)
        .bind(&invoice.period)
        .bind(invoice.rent_amount)
        .bind(invoice.charges_amount)
        .bind(invoice.total_amount)
        .bind(&invoice.currency)
        .bind(invoice.status.as_str())
        .bind(invoice.issued_at.timestamp_millis())
        .bind(invoice.paid_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        debug!(invoice_id = %invoice.id, lease_id = %invoice.lease_id, period = %invoice.period, "Created invoice");
        Ok(())
    }

    async fn find_invoice(&self, lease_id: &str, period: &str) -> Result<Option<Invoice>> {
        let query = format!(
            "SELECT {} FROM invoices WHERE lease_id = ? AND period = ? AND status != ? LIMIT 1",
            INVOICE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(lease_id)
            .bind(period)
            .bind(InvoiceStatus::Cancelled.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.parse_invoice(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_open_invoice(&self, lease_id: &str) -> Result<Option<Invoice>> {
        let query = format!(
            "SELECT {} FROM invoices WHERE lease_id = ? AND status IN (?, ?) \
             ORDER BY issued_at DESC LIMIT 1",
            INVOICE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(lease_id)
            .bind(InvoiceStatus::Sent.as_str())
            .bind(InvoiceStatus::Late.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.parse_invoice(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_invoice_paid(&self, invoice_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE invoices SET status = ?, paid_at = ? WHERE id = ?")
            .bind(InvoiceStatus::Paid.as_str())
            .bind(now.timestamp_millis())
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_invoice_late(&self, invoice_id: &str, _now: DateTime<Utc>) -> Result<()> {
        // Only an unpaid invoice can go late
        sqlx::query("UPDATE invoices SET status = ? WHERE id = ? AND status = ?")
            .bind(InvoiceStatus::Late.as_str())
            .bind(invoice_id)
            .bind(InvoiceStatus::Sent.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_payment(&self, payment: &Payment) -> Result<()> {
        sqlx::query(
            "INSERT INTO payments \
             (id, invoice_id, gateway_ref, amount, currency, status, error_message, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&payment.id)
        .bind(&payment.invoice_id)
        .bind(&payment.gateway_ref)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.error_message)
        .bind(payment.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn payments_for_invoice(&self, invoice_id: &str) -> Result<Vec<Payment>> {
        let rows = sqlx::query(
            "SELECT id, invoice_id, gateway_ref, amount, currency, status, error_message, created_at \
             FROM payments WHERE invoice_id = ? ORDER BY created_at ASC",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        let mut payments = Vec::with_capacity(rows.len());
        for row in &rows {
            payments.push(self.parse_payment(row)?);
        }
        Ok(payments)
    }
}
