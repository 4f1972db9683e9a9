//! Locapay SEPA Rent Collection
//!
//! Recurring direct-debit rent collection for leases:
//! - CollectionSchedule: the recurring obligation with its retry state
//! - Reconciler: idempotent invoice-then-charge, safe under overlapping runs
//! - CollectionRunner: the two-phase cron sweep (first attempts, due retries)
//! - PaymentGateway: boundary to the external payment provider
//!
//! Retry cadence is consumer-facing (days between direct-debit re-attempts)
//! but flows through the same retry decision as webhook delivery, via
//! `lp_queue::backoff`.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod gateway;
pub mod reconciler;
pub mod runner;
pub mod sqlite;
pub mod store;

pub use gateway::{
    ChargeRequest, ChargeResult, ChargeStatus, HttpGatewayConfig, HttpPaymentGateway,
    PaymentGateway,
};
pub use reconciler::{CollectionOutcome, Reconciler};
pub use runner::{CollectionRunner, CollectionRunnerConfig, RunStats};
pub use sqlite::SqliteCollectionStore;
pub use store::CollectionStore;

// ============================================================================
// Schedules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Active,
    /// Retry budget exhausted or mandate unusable; manual follow-up required
    Stopped,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "ACTIVE",
            ScheduleStatus::Stopped => "STOPPED",
            ScheduleStatus::Cancelled => "CANCELLED",
        }
    }
}

impl From<&str> for ScheduleStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "STOPPED" => Self::Stopped,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Active,
        }
    }
}

/// A recurring rent collection obligation for one lease.
///
/// Invariants: `retry_count <= max_retries`; `next_retry_at` is non-null
/// only while `0 < retry_count < max_retries`. Mutated only by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSchedule {
    pub id: String,
    pub lease_id: String,
    pub tenant_id: String,
    pub owner_id: String,
    /// Reference to the stored direct-debit authorization
    pub mandate_id: String,
    /// Day of month the debit is attempted, clamped to the month's length
    pub collection_day: u32,
    /// Rent in minor currency units
    pub rent_amount: i64,
    /// Recoverable charges in minor currency units
    pub charges_amount: i64,
    pub currency: String,
    pub status: ScheduleStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_failure_reason: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl CollectionSchedule {
    pub fn total_amount(&self) -> i64 {
        self.rent_amount + self.charges_amount
    }
}

// ============================================================================
// Mandates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MandateStatus {
    Active,
    Revoked,
}

impl MandateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MandateStatus::Active => "ACTIVE",
            MandateStatus::Revoked => "REVOKED",
        }
    }
}

impl From<&str> for MandateStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "REVOKED" => Self::Revoked,
            _ => Self::Active,
        }
    }
}

/// Authorization to debit one payment instrument for one lease. Created and
/// revoked by the onboarding flow; read-only to the collection engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMandate {
    pub id: String,
    pub lease_id: String,
    pub tenant_id: String,
    pub owner_id: String,
    /// Gateway-side customer reference
    pub customer_ref: String,
    /// Gateway-side payment method reference
    pub payment_method_ref: String,
    pub status: MandateStatus,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Billing Period
// ============================================================================

/// One billing month, keyed as "YYYY-MM".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("Invalid billing period: {}", s))?;
        let year: i32 = year.parse()?;
        let month: u32 = month.parse()?;
        if !(1..=12).contains(&month) {
            anyhow::bail!("Invalid billing month: {}", s);
        }
        Ok(Self { year, month })
    }
}

// ============================================================================
// Invoices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Late,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Sent => "SENT",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Late => "LATE",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }
}

impl From<&str> for InvoiceStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "DRAFT" => Self::Draft,
            "PAID" => Self::Paid,
            "LATE" => Self::Late,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Sent,
        }
    }
}

/// One rent invoice per (lease, billing period). At most one non-cancelled
/// invoice may exist for a given pair; the reconciler looks up before
/// creating and the store enforces it with a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub lease_id: String,
    /// Billing period key, "YYYY-MM"
    pub period: String,
    pub rent_amount: i64,
    pub charges_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Succeeded,
    /// Accepted by the gateway, settlement pending (normal for SEPA)
    Pending,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Failed => "FAILED",
        }
    }
}

impl From<&str> for PaymentStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One charge attempt against an invoice. Append-only; the only permitted
/// mutation is the pending -> succeeded settlement transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub invoice_id: String,
    /// Charge reference returned by the gateway, if the call got that far
    pub gateway_ref: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
