//! Webhook Delivery Executor
//!
//! Performs the one side-effecting network call for a webhook task. The
//! executor owns no state transitions: it never touches the database and it
//! never returns an error, so the worker can treat every possible failure
//! mode uniformly through `ExecutionOutcome`.

use async_trait::async_trait;
use lp_common::{ExecutionOutcome, WebhookTask};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::{debug, warn};

/// The side-effecting call a task represents, pluggable for tests.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &WebhookTask) -> ExecutionOutcome;
}

/// Webhook deliverer configuration
#[derive(Debug, Clone)]
pub struct WebhookDelivererConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for WebhookDelivererConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Delivers webhook tasks via HTTP POST with a JSON body.
pub struct WebhookDeliverer {
    client: reqwest::Client,
}

impl WebhookDeliverer {
    pub fn new(config: WebhookDelivererConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client })
    }

    fn build_headers(task: &WebhookTask) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(value) = HeaderValue::from_str(&task.event_type) {
            headers.insert(HeaderName::from_static("x-locapay-event"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&task.id) {
            headers.insert(HeaderName::from_static("x-locapay-delivery"), value);
        }

        for (name, value) in &task.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    warn!(task_id = %task.id, header = %name, "Skipping invalid header");
                }
            }
        }

        headers
    }

    /// Classify an HTTP response status. 2xx is success; 408 and 429 are
    /// transient despite being 4xx; other 4xx are permanent; everything else
    /// (5xx and friends) is transient.
    fn classify_status(status: u16, body: &str) -> ExecutionOutcome {
        if (200..300).contains(&status) {
            return ExecutionOutcome::success(Some(status));
        }

        let message = format!("HTTP {}: {}", status, truncate(body, 512));
        match status {
            408 | 429 => ExecutionOutcome::transient(Some(status), message),
            400..=499 => ExecutionOutcome::permanent(Some(status), message),
            _ => ExecutionOutcome::transient(Some(status), message),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl TaskExecutor for WebhookDeliverer {
    async fn execute(&self, task: &WebhookTask) -> ExecutionOutcome {
        debug!(task_id = %task.id, target = %task.target, "Delivering webhook");

        let request = self
            .client
            .post(&task.target)
            .headers(Self::build_headers(task))
            .json(&task.payload);

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                Self::classify_status(status, &body)
            }
            Err(e) if e.is_timeout() => {
                ExecutionOutcome::transient(None, format!("Request timed out: {}", e))
            }
            Err(e) => ExecutionOutcome::transient(None, format!("Request failed: {}", e)),
        }
    }
}
