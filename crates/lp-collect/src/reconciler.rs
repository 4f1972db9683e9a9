//! Idempotent collection of one (schedule, billing period) pair.
//!
//! The reconciler makes re-running a sweep safe: a paid invoice
//! short-circuits before any gateway call, the invoice is created before the
//! charge so a crash leaves a resumable trail, and the charge carries a
//! dedupe key stable per (lease, period) so a crash after the charge cannot
//! debit the tenant twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::gateway::{ChargeRequest, PaymentGateway};
use crate::store::CollectionStore;
use crate::{
    BillingPeriod, CollectionSchedule, Invoice, InvoiceStatus, MandateStatus, Payment,
    PaymentStatus,
};

/// What happened to one collection attempt.
#[derive(Debug, Clone)]
pub enum CollectionOutcome {
    /// The debit was accepted and the invoice is now paid.
    Collected {
        invoice_id: String,
        payment_id: String,
    },
    /// The period's invoice was already paid; nothing was charged.
    AlreadyPaid { invoice_id: String },
    /// The attempt failed. Retryable failures feed the retry cadence;
    /// non-retryable ones (unusable mandate) stop the schedule immediately.
    Failed {
        invoice_id: Option<String>,
        reason: String,
        retryable: bool,
    },
}

pub struct Reconciler {
    store: Arc<dyn CollectionStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn CollectionStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Collect rent for one schedule and period.
    ///
    /// `Err` is reserved for storage failures; every gateway failure mode
    /// collapses into `CollectionOutcome::Failed`.
    pub async fn collect(
        &self,
        schedule: &CollectionSchedule,
        period: &BillingPeriod,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CollectionOutcome> {
        let period_key = period.key();

        // Step 1: the period's invoice decides whether there is anything to do.
        let existing = self
            .store
            .find_invoice(&schedule.lease_id, &period_key)
            .await?;
        if let Some(invoice) = &existing {
            if invoice.status == InvoiceStatus::Paid {
                debug!(
                    lease_id = %schedule.lease_id,
                    period = %period_key,
                    "Invoice already paid, skipping charge"
                );
                return Ok(CollectionOutcome::AlreadyPaid {
                    invoice_id: invoice.id.clone(),
                });
            }
        }

        // Step 2: a charge needs a usable mandate.
        let mandate = self.store.get_mandate(&schedule.mandate_id).await?;
        let mandate = match mandate {
            Some(m) if m.status == MandateStatus::Active => m,
            Some(_) => {
                warn!(
                    schedule_id = %schedule.id,
                    mandate_id = %schedule.mandate_id,
                    "Mandate revoked"
                );
                return Ok(CollectionOutcome::Failed {
                    invoice_id: existing.map(|i| i.id),
                    reason: format!("Mandate {} is revoked", schedule.mandate_id),
                    retryable: false,
                });
            }
            None => {
                warn!(
                    schedule_id = %schedule.id,
                    mandate_id = %schedule.mandate_id,
                    "Mandate not found"
                );
                return Ok(CollectionOutcome::Failed {
                    invoice_id: existing.map(|i| i.id),
                    reason: format!("Mandate {} not found", schedule.mandate_id),
                    retryable: false,
                });
            }
        };

        // Step 3: invoice before charge, so a crash leaves a SENT invoice the
        // next run resumes from.
        let invoice = match existing {
            Some(invoice) => invoice,
            None => {
                let invoice = Invoice {
                    id: uuid::Uuid::new_v4().to_string(),
                    lease_id: schedule.lease_id.clone(),
                    period: period_key.clone(),
                    rent_amount: schedule.rent_amount,
                    charges_amount: schedule.charges_amount,
                    total_amount: schedule.total_amount(),
                    currency: schedule.currency.clone(),
                    status: InvoiceStatus::Sent,
                    issued_at: now,
                    paid_at: None,
                };
                self.store.create_invoice(&invoice).await?;
                invoice
            }
        };

        // Step 4: charge, keyed so a replay cannot double-debit.
        let request = ChargeRequest {
            customer_ref: mandate.customer_ref.clone(),
            payment_method_ref: mandate.payment_method_ref.clone(),
            amount: invoice.total_amount,
            currency: invoice.currency.clone(),
            idempotency_key: format!("{}:{}", schedule.lease_id, period_key),
            description: format!("Rent {} lease {}", period_key, schedule.lease_id),
        };

        match self.gateway.create_charge(&request).await {
            Ok(result) if result.accepted() => {
                let payment = Payment {
                    id: uuid::Uuid::new_v4().to_string(),
                    invoice_id: invoice.id.clone(),
                    gateway_ref: Some(result.id),
                    amount: invoice.total_amount,
                    currency: invoice.currency.clone(),
                    status: match result.status {
                        crate::ChargeStatus::Succeeded => PaymentStatus::Succeeded,
                        _ => PaymentStatus::Pending,
                    },
                    error_message: None,
                    created_at: now,
                };
                self.store.record_payment(&payment).await?;
                self.store.mark_invoice_paid(&invoice.id, now).await?;

                info!(
                    lease_id = %schedule.lease_id,
                    period = %period_key,
                    amount = invoice.total_amount,
                    "Rent collected"
                );
                Ok(CollectionOutcome::Collected {
                    invoice_id: invoice.id,
                    payment_id: payment.id,
                })
            }
            Ok(result) => {
                let reason = result
                    .failure_message
                    .unwrap_or_else(|| "charge declined".to_string());
                self.record_failed_payment(&invoice, &reason, now).await?;
                Ok(CollectionOutcome::Failed {
                    invoice_id: Some(invoice.id),
                    reason,
                    retryable: true,
                })
            }
            Err(e) => {
                // Unknown outcome: the idempotency key makes the retry safe.
                let reason = format!("Gateway call failed: {}", e);
                self.record_failed_payment(&invoice, &reason, now).await?;
                Ok(CollectionOutcome::Failed {
                    invoice_id: Some(invoice.id),
                    reason,
                    retryable: true,
                })
            }
        }
    }

    async fn record_failed_payment(
        &self,
        invoice: &Invoice,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let payment = Payment {
            id: uuid::Uuid::new_v4().to_string(),
            invoice_id: invoice.id.clone(),
            gateway_ref: None,
            amount: invoice.total_amount,
            currency: invoice.currency.clone(),
            status: PaymentStatus::Failed,
            error_message: Some(reason.to_string()),
            created_at: now,
        };
        self.store.record_payment(&payment).await
    }
}
