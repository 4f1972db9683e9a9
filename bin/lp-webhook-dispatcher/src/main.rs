//! Locapay Webhook Dispatcher
//!
//! Long-running worker draining the durable webhook queue: polls for due
//! tasks, delivers them with bounded concurrency, and applies exponential
//! backoff on transient failures. A background recovery task releases tasks
//! orphaned by a crashed worker, and old succeeded tasks are purged hourly.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOCAPAY_CONFIG` | - | Path to config.toml |
//! | `LOCAPAY_DATABASE_URL` | `sqlite://./data/locapay.db?mode=rwc` | sqlx connection URL |
//! | `LOCAPAY_WEBHOOK_POLL_INTERVAL_MS` | `1000` | Sweep interval |
//! | `LOCAPAY_WEBHOOK_BATCH_SIZE` | `10` | Due tasks per sweep |
//! | `LOCAPAY_WEBHOOK_MAX_RETRIES` | `5` | Default retry budget |
//! | `RUST_LOG` | `info` | Log level |
//! | `LOG_FORMAT` | `text` | `json` for production output |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use lp_config::ConfigLoader;
use lp_queue::{
    DeliveryWorker, DeliveryWorkerConfig, RecoveryConfig, RetryPolicy, SqliteEventLog,
    SqliteTaskRepository, StuckTaskRecovery, TaskRepository, WebhookDeliverer,
    WebhookDelivererConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    lp_common::logging::init_logging("lp-webhook-dispatcher");

    let config = ConfigLoader::new().load()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Connected to database: {}", config.database.url);

    let repository = SqliteTaskRepository::new(pool.clone());
    repository.init_schema().await?;
    let repository: Arc<SqliteTaskRepository> = Arc::new(repository);

    let event_log = SqliteEventLog::new(pool);
    event_log.init_schema().await?;

    let deliverer = WebhookDeliverer::new(WebhookDelivererConfig {
        request_timeout: Duration::from_secs(config.webhook.request_timeout_secs),
        ..Default::default()
    })?;

    let worker = DeliveryWorker::new(
        repository.clone(),
        Arc::new(deliverer),
        Arc::new(event_log),
        RetryPolicy::webhook_default(),
        DeliveryWorkerConfig {
            batch_size: config.webhook.batch_size,
            concurrency: config.webhook.concurrency,
        },
    );

    // Background recovery for tasks orphaned by a crashed worker
    let recovery = StuckTaskRecovery::new(
        repository.clone(),
        RecoveryConfig {
            stuck_timeout: Duration::from_secs(config.webhook.stuck_timeout_secs),
            ..Default::default()
        },
    );
    let recovery_handle = tokio::spawn(async move { recovery.run().await });

    info!(
        poll_interval_ms = config.webhook.poll_interval_ms,
        batch_size = config.webhook.batch_size,
        "Webhook dispatcher started, press Ctrl+C to shutdown"
    );

    let mut sweep_tick = interval(Duration::from_millis(config.webhook.poll_interval_ms));
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut purge_tick = interval(Duration::from_secs(3600));
    purge_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = sweep_tick.tick() => {
                if let Err(e) = worker.sweep(Utc::now()).await {
                    error!("Sweep failed: {}", e);
                }
            }
            _ = purge_tick.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(config.webhook.purge_after_days);
                match repository.purge_succeeded(cutoff).await {
                    Ok(purged) if purged > 0 => info!("Purged {} old succeeded tasks", purged),
                    Ok(_) => {}
                    Err(e) => error!("Purge failed: {}", e),
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received...");
                break;
            }
        }
    }

    recovery_handle.abort();
    info!("Webhook dispatcher shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
