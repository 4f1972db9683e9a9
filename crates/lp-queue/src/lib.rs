//! Locapay Retryable Task Queue
//!
//! A durable task queue for side-effecting external calls with capped
//! exponential backoff and dead-lettering:
//! - TaskRepository: persistence contract with a conditional claim guard
//! - WebhookDeliverer: the one network call, timeout-bounded, never throws
//! - RetryPolicy / decide: the shared retry decision used by webhook delivery
//!   and rent collection alike
//! - DeliveryWorker: sweep-based batch runner with per-item error isolation
//! - StuckTaskRecovery: resets tasks abandoned mid-claim by a crashed worker

pub mod backoff;
pub mod delivery;
pub mod events;
pub mod recovery;
pub mod repository;
pub mod sqlite;
pub mod worker;

pub use backoff::{decide, Disposition, RetryPolicy};
pub use delivery::{TaskExecutor, WebhookDeliverer, WebhookDelivererConfig};
pub use events::SqliteEventLog;
pub use recovery::{RecoveryConfig, StuckTaskRecovery};
pub use repository::{EnqueueOptions, TaskRepository};
pub use sqlite::SqliteTaskRepository;
pub use worker::{DeliveryWorker, DeliveryWorkerConfig, SweepStats};
