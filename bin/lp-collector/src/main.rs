//! Locapay Rent Collector
//!
//! One-shot daily sweep over all collection schedules: first attempts for
//! today's collection day, then due re-attempts. Designed to run from cron;
//! re-running the same day is safe because collection is idempotent per
//! (lease, billing period).
//!
//! ## Usage
//!
//! ```text
//! lp-collector                  # run today's sweep
//! lp-collector resume <id>      # put a stopped schedule back in rotation
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LOCAPAY_CONFIG` | - | Path to config.toml |
//! | `LOCAPAY_DATABASE_URL` | `sqlite://./data/locapay.db?mode=rwc` | sqlx connection URL |
//! | `LOCAPAY_GATEWAY_URL` | - | Payment gateway base URL |
//! | `LOCAPAY_GATEWAY_API_KEY` | - | Gateway bearer token |
//! | `LOCAPAY_COLLECTION_BATCH_SIZE` | `100` | Schedules per phase per sweep |
//! | `LOCAPAY_COLLECTION_MAX_RETRIES` | `3` | Default retry budget |
//! | `RUST_LOG` | `info` | Log level |
//! | `LOG_FORMAT` | `text` | `json` for production output |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use lp_collect::{
    CollectionRunner, CollectionRunnerConfig, HttpGatewayConfig, HttpPaymentGateway,
    SqliteCollectionStore,
};
use lp_config::ConfigLoader;
use lp_queue::{RetryPolicy, SqliteEventLog};

#[tokio::main]
async fn main() -> Result<()> {
    lp_common::logging::init_logging("lp-collector");

    let config = ConfigLoader::new().load()?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Connected to database: {}", config.database.url);

    let store = SqliteCollectionStore::new(pool.clone());
    store.init_schema().await?;
    let store = Arc::new(store);

    let event_log = SqliteEventLog::new(pool);
    event_log.init_schema().await?;

    let gateway = HttpPaymentGateway::new(HttpGatewayConfig {
        base_url: config.gateway.base_url.clone(),
        api_key: config.gateway.api_key.clone(),
        connect_timeout: Duration::from_secs(config.gateway.connect_timeout_secs),
        request_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
    })?;

    let runner = CollectionRunner::new(
        store,
        Arc::new(gateway),
        Arc::new(event_log),
        RetryPolicy::from_day_offsets(&config.collection.retry_offsets_days),
        CollectionRunnerConfig {
            batch_size: config.collection.batch_size,
        },
    );

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("resume") => {
            let schedule_id = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("Usage: lp-collector resume <schedule_id>"))?;
            if runner.resume_schedule(&schedule_id, Utc::now()).await? {
                info!("Schedule {} resumed", schedule_id);
            } else {
                anyhow::bail!("Schedule {} is not stopped", schedule_id);
            }
        }
        Some(other) => anyhow::bail!("Unknown command: {}", other),
        None => {
            info!("Starting collection sweep");
            let stats = runner.run(Utc::now()).await?;
            info!(
                processed = stats.processed,
                collected = stats.collected,
                already_paid = stats.already_paid,
                retried = stats.retried,
                stopped = stats.stopped,
                errors = stats.errors,
                "Collection sweep finished"
            );
            if stats.errors > 0 {
                anyhow::bail!("{} schedules failed with storage errors", stats.errors);
            }
        }
    }

    Ok(())
}
