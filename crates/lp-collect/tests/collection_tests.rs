//! Integration tests for the rent collection engine.
//!
//! In-memory SQLite store, a programmable stub gateway and a capturing
//! emitter. Sweeps are driven with explicit timestamps so the multi-day
//! retry cadence can be stepped through instantly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use lp_collect::{
    ChargeRequest, ChargeResult, ChargeStatus, CollectionRunner, CollectionRunnerConfig,
    CollectionSchedule, CollectionStore, InvoiceStatus, MandateStatus, PaymentGateway,
    PaymentMandate, PaymentStatus, ScheduleStatus, SqliteCollectionStore,
};
use lp_common::{AuditRecord, DomainEvent, EventEmitter};
use lp_queue::RetryPolicy;
use sqlx::sqlite::SqlitePoolOptions;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum GatewayMode {
    Accept,
    Decline,
    Unavailable,
}

struct StubGateway {
    mode: Mutex<GatewayMode>,
    charges: AtomicUsize,
}

impl StubGateway {
    fn new(mode: GatewayMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            charges: AtomicUsize::new(0),
        })
    }

    fn set_mode(&self, mode: GatewayMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn charge_count(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> anyhow::Result<ChargeResult> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock().unwrap() {
            GatewayMode::Accept => Ok(ChargeResult {
                id: format!("ch_{}", request.idempotency_key),
                status: ChargeStatus::Processing,
                failure_message: None,
            }),
            GatewayMode::Decline => Ok(ChargeResult {
                id: String::new(),
                status: ChargeStatus::Failed,
                failure_message: Some("insufficient_funds".to_string()),
            }),
            GatewayMode::Unavailable => anyhow::bail!("Gateway returned HTTP 503"),
        }
    }
}

#[derive(Default)]
struct CapturingEmitter {
    events: Mutex<Vec<DomainEvent>>,
}

impl CapturingEmitter {
    fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventEmitter for CapturingEmitter {
    async fn emit(&self, event: DomainEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn audit(&self, _record: AuditRecord) {}
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

async fn memory_store() -> Arc<SqliteCollectionStore> {
    // Single connection so the in-memory database is shared
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteCollectionStore::new(pool);
    store.init_schema().await.unwrap();
    Arc::new(store)
}

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
        .and_utc()
}

async fn seed_lease(
    store: &SqliteCollectionStore,
    collection_day: u32,
    max_retries: i32,
    mandate_status: MandateStatus,
) -> CollectionSchedule {
    let created = at(2026, 1, 1);
    let mandate = PaymentMandate {
        id: "mandate-1".to_string(),
        lease_id: "lease-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        owner_id: "owner-1".to_string(),
        customer_ref: "cus_1".to_string(),
        payment_method_ref: "pm_sepa_1".to_string(),
        status: mandate_status,
        created_at: created,
    };
    store.create_mandate(&mandate).await.unwrap();

    let schedule = CollectionSchedule {
        id: "schedule-1".to_string(),
        lease_id: "lease-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        owner_id: "owner-1".to_string(),
        mandate_id: "mandate-1".to_string(),
        collection_day,
        rent_amount: 100_000,
        charges_amount: 8_000,
        currency: "EUR".to_string(),
        status: ScheduleStatus::Active,
        retry_count: 0,
        max_retries,
        last_failure_reason: None,
        next_retry_at: None,
        last_attempt_at: None,
        created_at: created,
        updated_at: None,
    };
    store.create_schedule(&schedule).await.unwrap();
    schedule
}

fn runner(
    store: Arc<SqliteCollectionStore>,
    gateway: Arc<StubGateway>,
    emitter: Arc<CapturingEmitter>,
) -> CollectionRunner {
    CollectionRunner::new(
        store,
        gateway,
        emitter,
        RetryPolicy::collection_default(),
        CollectionRunnerConfig::default(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_first_attempt_collects_rent() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Accept);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let stats = runner(store.clone(), gateway.clone(), emitter.clone())
        .run(at(2026, 3, 15))
        .await
        .unwrap();
    assert_eq!(stats.collected, 1);
    assert_eq!(stats.errors, 0);

    // Invoice carries rent + charges and is settled
    let invoice = store
        .find_invoice("lease-1", "2026-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.total_amount, 108_000);
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert!(invoice.paid_at.is_some());

    let payments = store.payments_for_invoice(&invoice.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount, 108_000);
    assert_eq!(payments[0].status, PaymentStatus::Pending);
    assert!(payments[0].gateway_ref.is_some());

    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.retry_count, 0);
    assert!(schedule.next_retry_at.is_none());

    assert_eq!(gateway.charge_count(), 1);
    assert_eq!(emitter.count("payment.collected"), 1);
}

#[tokio::test]
async fn test_rerun_same_day_charges_once() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Accept);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let runner = runner(store.clone(), gateway.clone(), emitter.clone());
    runner.run(at(2026, 3, 15)).await.unwrap();
    let stats = runner.run(at(2026, 3, 15)).await.unwrap();

    // The paid invoice short-circuits the second run before the gateway
    assert_eq!(stats.already_paid, 1);
    assert_eq!(stats.collected, 0);
    assert_eq!(gateway.charge_count(), 1);

    let invoice = store
        .find_invoice("lease-1", "2026-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(store.payments_for_invoice(&invoice.id).await.unwrap().len(), 1);
    assert_eq!(emitter.count("payment.collected"), 1);
}

#[tokio::test]
async fn test_nothing_due_on_other_days() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Accept);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let stats = runner(store.clone(), gateway.clone(), emitter)
        .run(at(2026, 3, 14))
        .await
        .unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(gateway.charge_count(), 0);
}

#[tokio::test]
async fn test_declined_charge_schedules_retry_in_days() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Decline);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let now = at(2026, 3, 15);
    let stats = runner(store.clone(), gateway.clone(), emitter.clone())
        .run(now)
        .await
        .unwrap();
    assert_eq!(stats.retried, 1);

    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.retry_count, 1);
    // First re-attempt is 3 days out
    assert_eq!(
        schedule.next_retry_at.unwrap().timestamp_millis(),
        (now + Duration::days(3)).timestamp_millis()
    );
    assert!(schedule
        .last_failure_reason
        .unwrap()
        .contains("insufficient_funds"));

    // The invoice stays open and the failed attempt is on record
    let invoice = store
        .find_invoice("lease-1", "2026-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sent);
    let payments = store.payments_for_invoice(&invoice.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);

    assert_eq!(emitter.count("payment.failed.retry_scheduled"), 1);
}

#[tokio::test]
async fn test_success_on_retry_resets_counters() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Decline);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let runner = runner(store.clone(), gateway.clone(), emitter.clone());
    runner.run(at(2026, 3, 15)).await.unwrap();

    gateway.set_mode(GatewayMode::Accept);
    let stats = runner.run(at(2026, 3, 18) + Duration::hours(1)).await.unwrap();
    assert_eq!(stats.collected, 1);

    // Success clears all failure state
    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.retry_count, 0);
    assert!(schedule.next_retry_at.is_none());
    assert!(schedule.last_failure_reason.is_none());

    let invoice = store
        .find_invoice("lease-1", "2026-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(gateway.charge_count(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_stop_schedule() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Decline);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let runner = runner(store.clone(), gateway.clone(), emitter.clone());

    // Day 15: first attempt fails, retry in 3 days
    runner.run(at(2026, 3, 15)).await.unwrap();
    // Day 18: second failure, retry in 7 days
    let stats = runner.run(at(2026, 3, 18) + Duration::hours(1)).await.unwrap();
    assert_eq!(stats.retried, 1);
    // Day 25: third consecutive failure exhausts the budget
    let stats = runner.run(at(2026, 3, 25) + Duration::hours(2)).await.unwrap();
    assert_eq!(stats.stopped, 1);

    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Stopped);
    assert_eq!(schedule.retry_count, 3);
    assert!(schedule.next_retry_at.is_none());

    // The invoice went late, never paid
    let invoice = store
        .find_invoice("lease-1", "2026-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Late);

    assert_eq!(gateway.charge_count(), 3);
    assert_eq!(emitter.count("payment.failed.retry_scheduled"), 2);
    assert_eq!(emitter.count("payment.failed.final"), 1);
    assert_eq!(emitter.count("payment.collected"), 0);

    // A stopped schedule is out of rotation
    let stats = runner.run(at(2026, 4, 15)).await.unwrap();
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn test_revoked_mandate_stops_without_charging() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Accept);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Revoked).await;

    let stats = runner(store.clone(), gateway.clone(), emitter.clone())
        .run(at(2026, 3, 15))
        .await
        .unwrap();
    assert_eq!(stats.stopped, 1);

    // Non-retryable: no retry budget is burned waiting on a dead mandate
    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Stopped);
    assert_eq!(schedule.retry_count, 1);
    assert!(schedule.last_failure_reason.unwrap().contains("revoked"));

    assert_eq!(gateway.charge_count(), 0);
    assert_eq!(emitter.count("payment.failed.final"), 1);
}

#[tokio::test]
async fn test_gateway_outage_is_retryable() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Unavailable);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Active).await;

    let stats = runner(store.clone(), gateway.clone(), emitter)
        .run(at(2026, 3, 15))
        .await
        .unwrap();
    assert_eq!(stats.retried, 1);

    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.retry_count, 1);
    assert!(schedule.last_failure_reason.unwrap().contains("503"));
}

#[tokio::test]
async fn test_collection_day_clamped_to_short_month() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Accept);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 31, 3, MandateStatus::Active).await;

    // February 2026 has 28 days; day-31 schedules collect on the 28th
    let stats = runner(store.clone(), gateway.clone(), emitter)
        .run(at(2026, 2, 28))
        .await
        .unwrap();
    assert_eq!(stats.collected, 1);

    let invoice = store
        .find_invoice("lease-1", "2026-02")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_retry_crossing_month_settles_original_period() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Decline);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 25, 3, MandateStatus::Active).await;

    let runner = runner(store.clone(), gateway.clone(), emitter.clone());
    // March 25 fails, March 28 fails again, next retry lands April 4
    runner.run(at(2026, 3, 25)).await.unwrap();
    runner.run(at(2026, 3, 28) + Duration::hours(1)).await.unwrap();

    gateway.set_mode(GatewayMode::Accept);
    let stats = runner.run(at(2026, 4, 4) + Duration::hours(1)).await.unwrap();
    assert_eq!(stats.collected, 1);

    // The April retry settles the March invoice, not a new April one
    let invoice = store
        .find_invoice("lease-1", "2026-03")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert!(store.find_invoice("lease-1", "2026-04").await.unwrap().is_none());
}

#[tokio::test]
async fn test_resume_stopped_schedule() {
    let store = memory_store().await;
    let gateway = StubGateway::new(GatewayMode::Accept);
    let emitter = Arc::new(CapturingEmitter::default());
    seed_lease(&store, 15, 3, MandateStatus::Revoked).await;

    let runner = runner(store.clone(), gateway.clone(), emitter);
    runner.run(at(2026, 3, 15)).await.unwrap();
    assert_eq!(
        store.get_schedule("schedule-1").await.unwrap().unwrap().status,
        ScheduleStatus::Stopped
    );

    assert!(runner.resume_schedule("schedule-1", at(2026, 3, 20)).await.unwrap());
    let schedule = store.get_schedule("schedule-1").await.unwrap().unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    assert_eq!(schedule.retry_count, 0);

    // Resuming an active schedule is a no-op
    assert!(!runner.resume_schedule("schedule-1", at(2026, 3, 20)).await.unwrap());
}
