//! Integration tests for the webhook delivery worker.
//!
//! Uses an in-memory SQLite repository and a wiremock HTTP target, driving
//! sweeps with explicit timestamps so retry schedules can be stepped through
//! without sleeping.

use std::sync::Arc;

use chrono::{Duration, Utc};
use lp_common::{NoopEmitter, TaskStatus};
use lp_queue::{
    DeliveryWorker, DeliveryWorkerConfig, EnqueueOptions, RetryPolicy, SqliteTaskRepository,
    TaskRepository, WebhookDeliverer, WebhookDelivererConfig,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn memory_repository() -> Arc<SqliteTaskRepository> {
    // Single connection so the in-memory database is shared
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repository = SqliteTaskRepository::new(pool);
    repository.init_schema().await.unwrap();
    Arc::new(repository)
}

fn worker(repository: Arc<SqliteTaskRepository>) -> DeliveryWorker {
    let executor = Arc::new(
        WebhookDeliverer::new(WebhookDelivererConfig::default()).unwrap(),
    );
    DeliveryWorker::new(
        repository,
        executor,
        Arc::new(NoopEmitter),
        RetryPolicy::webhook_default(),
        DeliveryWorkerConfig::default(),
    )
}

async fn enqueue(
    repository: &SqliteTaskRepository,
    server: &MockServer,
    max_retries: i32,
) -> String {
    repository
        .enqueue(
            "lease.signed",
            json!({"lease_id": "lease-42"}),
            &format!("{}/hooks", server.uri()),
            EnqueueOptions {
                max_retries,
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sweep_delivers_due_task() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    let task_id = enqueue(&repository, &server, 5).await;

    let stats = worker(repository.clone()).sweep(Utc::now()).await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.retried, 0);

    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.retry_count, 0);
    assert!(task.next_retry_at.is_none());
}

#[tokio::test]
async fn test_transient_failure_schedules_first_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    let task_id = enqueue(&repository, &server, 5).await;

    let now = Utc::now();
    let stats = worker(repository.clone()).sweep(now).await.unwrap();
    assert_eq!(stats.retried, 1);

    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    // First retry is 5 seconds out
    let next = task.next_retry_at.unwrap();
    assert_eq!(
        next.timestamp_millis() / 1000,
        (now + Duration::seconds(5)).timestamp_millis() / 1000
    );
    assert!(task.error_message.unwrap().contains("503"));
}

#[tokio::test]
async fn test_dead_letter_exactly_on_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    let task_id = enqueue(&repository, &server, 3).await;
    let worker = worker(repository.clone());

    // Step simulated time past each scheduled retry
    let mut now = Utc::now();
    for expected_count in 1..=2 {
        let stats = worker.sweep(now).await.unwrap();
        assert_eq!(stats.retried, 1, "failure {} should reschedule", expected_count);
        let task = repository.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, expected_count);
        now = task.next_retry_at.unwrap() + Duration::seconds(1);
    }

    // Third consecutive failure exhausts the budget
    let stats = worker.sweep(now).await.unwrap();
    assert_eq!(stats.dead_lettered, 1);

    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);
    assert_eq!(task.retry_count, 3);
    assert!(task.next_retry_at.is_none());

    // Nothing is due anymore
    let stats = worker.sweep(now + Duration::hours(2)).await.unwrap();
    assert_eq!(stats.processed, 0);
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad signature"))
        .expect(1)
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    let task_id = enqueue(&repository, &server, 5).await;

    let stats = worker(repository.clone()).sweep(Utc::now()).await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.retried, 0);

    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);
    assert!(task.error_message.unwrap().contains("400"));
}

#[tokio::test]
async fn test_concurrent_sweeps_deliver_at_most_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    enqueue(&repository, &server, 5).await;

    let worker_a = worker(repository.clone());
    let worker_b = worker(repository.clone());

    let now = Utc::now();
    let (stats_a, stats_b) = tokio::join!(worker_a.sweep(now), worker_b.sweep(now));
    let (stats_a, stats_b) = (stats_a.unwrap(), stats_b.unwrap());

    // The claim guard lets exactly one sweep own the task
    assert_eq!(stats_a.succeeded + stats_b.succeeded, 1);
    assert_eq!(stats_a.skipped + stats_b.skipped, 1);
}

#[tokio::test]
async fn test_reset_dead_letter_makes_task_due_again() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    let task_id = enqueue(&repository, &server, 5).await;
    let worker = worker(repository.clone());

    let now = Utc::now();
    worker.sweep(now).await.unwrap();
    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::DeadLetter);

    // Manual operator recovery
    assert!(worker.retry_dead_letter(&task_id, now).await.unwrap());
    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);

    // Resetting twice is a no-op
    assert!(!worker.retry_dead_letter(&task_id, now).await.unwrap());

    let stats = worker.sweep(now).await.unwrap();
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn test_stuck_task_released_after_timeout() {
    let server = MockServer::start().await;
    let repository = memory_repository().await;
    let task_id = enqueue(&repository, &server, 5).await;

    let now = Utc::now();
    assert!(repository.claim(&task_id, now).await.unwrap());

    // Within the timeout nothing is released
    let released = repository
        .release_stuck(std::time::Duration::from_secs(300), now + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(released, 0);

    let released = repository
        .release_stuck(std::time::Duration::from_secs(300), now + Duration::seconds(400))
        .await
        .unwrap();
    assert_eq!(released, 1);

    let task = repository.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_purge_removes_only_old_successes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let repository = memory_repository().await;
    let done_id = enqueue(&repository, &server, 5).await;
    let pending_id = enqueue(&repository, &server, 5).await;

    let now = Utc::now();
    repository.mark_succeeded(&done_id, now).await.unwrap();

    let purged = repository
        .purge_succeeded(now + Duration::days(31))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    assert!(repository.get(&done_id).await.unwrap().is_none());
    assert!(repository.get(&pending_id).await.unwrap().is_some());
}
