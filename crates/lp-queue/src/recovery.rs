//! Crash recovery for stuck tasks.
//!
//! A worker that crashes between `claim` and the terminal update leaves its
//! tasks in PROCESSING forever. This background task periodically resets
//! tasks stuck past a timeout back to PENDING so the next sweep picks them up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::repository::TaskRepository;

/// Configuration for the crash recovery task.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often to check for stuck tasks. Default: 60 seconds.
    pub check_interval: Duration,
    /// How long a task can be in PROCESSING before it's considered stuck.
    /// Default: 5 minutes.
    pub stuck_timeout: Duration,
    /// Whether recovery is enabled. Default: true.
    pub enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            stuck_timeout: Duration::from_secs(300),
            enabled: true,
        }
    }
}

/// Background task that recovers stuck queue items.
pub struct StuckTaskRecovery {
    repository: Arc<dyn TaskRepository>,
    config: RecoveryConfig,
}

impl StuckTaskRecovery {
    pub fn new(repository: Arc<dyn TaskRepository>, config: RecoveryConfig) -> Self {
        Self { repository, config }
    }

    /// Start the recovery task. This runs indefinitely until cancelled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Task recovery is disabled");
            return;
        }

        info!(
            "Starting task recovery (interval: {:?}, timeout: {:?})",
            self.config.check_interval, self.config.stuck_timeout
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.recover_once().await;
        }
    }

    /// Perform a single recovery check.
    pub async fn recover_once(&self) {
        debug!("Checking for stuck tasks");
        match self
            .repository
            .release_stuck(self.config.stuck_timeout, Utc::now())
            .await
        {
            Ok(count) => {
                if count > 0 {
                    info!("Recovered {} stuck tasks", count);
                    metrics::counter!("webhook.recovered_total").increment(count);
                }
            }
            Err(e) => {
                error!("Failed to recover stuck tasks: {}", e);
            }
        }
    }
}
