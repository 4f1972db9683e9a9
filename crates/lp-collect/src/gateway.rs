//! Payment gateway boundary.
//!
//! The engine only ever creates charges; mandate and customer setup belong to
//! the onboarding flow. `HttpPaymentGateway` talks to a Stripe-like REST API;
//! tests substitute their own `PaymentGateway` implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// One direct-debit charge request.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub customer_ref: String,
    pub payment_method_ref: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    /// Dedupe key, stable per (lease, billing period). The gateway must
    /// return the original charge when a key is replayed.
    pub idempotency_key: String,
    pub description: String,
}

/// Gateway-side charge state.
///
/// SEPA debits settle days after submission, so `Processing` counts as an
/// accepted collection; a later settlement failure arrives out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Succeeded,
    #[serde(alias = "pending")]
    Processing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChargeResult {
    /// Gateway charge reference
    pub id: String,
    pub status: ChargeStatus,
    /// Decline reason when `status` is Failed
    pub failure_message: Option<String>,
}

impl ChargeResult {
    pub fn accepted(&self) -> bool {
        matches!(self.status, ChargeStatus::Succeeded | ChargeStatus::Processing)
    }
}

/// Boundary to the external payment provider.
///
/// `Err` means the charge outcome is unknown (network failure, 5xx) and the
/// attempt should be retried; a declined charge is `Ok` with `Failed` status.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> anyhow::Result<ChargeResult>;
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.payment-provider.example".to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    id: String,
    status: ChargeStatus,
    #[serde(default)]
    failure_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorResponse {
    #[serde(default)]
    error: Option<GatewayErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// PaymentGateway over HTTP (reqwest).
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: HttpGatewayConfig,
}

impl HttpPaymentGateway {
    pub fn new(config: HttpGatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> anyhow::Result<ChargeResult> {
        let url = format!("{}/v1/charges", self.config.base_url.trim_end_matches('/'));

        let mut builder = self
            .client
            .post(&url)
            .header("idempotency-key", &request.idempotency_key)
            .json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            let charge: ChargeResponse = response.json().await?;
            debug!(charge_id = %charge.id, status = ?charge.status, "Gateway charge created");
            return Ok(ChargeResult {
                id: charge.id,
                status: charge.status,
                failure_message: charge.failure_message,
            });
        }

        // 402 is a decline: a definitive answer, not an infrastructure error
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            let body: GatewayErrorResponse = response.json().await.unwrap_or(GatewayErrorResponse {
                error: None,
            });
            let message = body
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "charge declined".to_string());
            warn!(idempotency_key = %request.idempotency_key, message = %message, "Charge declined");
            return Ok(ChargeResult {
                id: String::new(),
                status: ChargeStatus::Failed,
                failure_message: Some(message),
            });
        }

        anyhow::bail!("Gateway returned HTTP {}", status.as_u16())
    }
}
