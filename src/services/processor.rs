//! External card processor client.
//!
//! The settlement orchestrator talks to the processor through the
//! [`CardProcessor`] trait; [`HttpCardProcessor`] is the production
//! implementation. The refund call is synchronous within the settlement and a
//! failure aborts the whole unit of work.

use crate::config::ProcessorConfig;
use crate::error::AppError;
use crate::services::metrics::PROCESSOR_REFUND_DURATION;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Reason code sent with a refund request.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    RequestedByCustomer,
}

/// Completed refund as reported by the processor.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorRefund {
    /// Processor-side refund identifier, stored on the return for audit.
    pub id: String,
    pub status: String,
}

/// Card payment processor contract used by refund settlement.
#[async_trait]
pub trait CardProcessor: Send + Sync {
    /// Refund `amount_cents` against the charge identified by
    /// `processor_ref`. Errors abort the settlement.
    async fn refund(
        &self,
        processor_ref: &str,
        amount_cents: i64,
        reason: RefundReason,
    ) -> Result<ProcessorRefund, AppError>;
}

/// HTTP client for the processor's refund API.
#[derive(Clone)]
pub struct HttpCardProcessor {
    client: Client,
    config: ProcessorConfig,
}

#[derive(Debug, Serialize)]
struct RefundRequest {
    amount: i64,
    reason: RefundReason,
}

/// Processor API error body.
#[derive(Debug, Deserialize)]
struct ProcessorErrorBody {
    error: ProcessorErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ProcessorErrorDetail {
    code: String,
    description: String,
}

impl HttpCardProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check that credentials are set.
    pub fn is_configured(&self) -> bool {
        !self.config.key_id.is_empty() && !self.config.key_secret.expose_secret().is_empty()
    }
}

#[async_trait]
impl CardProcessor for HttpCardProcessor {
    #[instrument(skip(self), fields(processor_ref = %processor_ref, amount_cents = amount_cents))]
    async fn refund(
        &self,
        processor_ref: &str,
        amount_cents: i64,
        reason: RefundReason,
    ) -> Result<ProcessorRefund, AppError> {
        if !self.is_configured() {
            return Err(AppError::ExternalProcessorError(anyhow::anyhow!(
                "Card processor credentials not configured"
            )));
        }

        let url = format!(
            "{}/v1/charges/{}/refunds",
            self.config.base_url, processor_ref
        );

        let timer = PROCESSOR_REFUND_DURATION
            .with_label_values(&["attempted"])
            .start_timer();

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.key_id,
                Some(self.config.key_secret.expose_secret()),
            )
            .json(&RefundRequest {
                amount: amount_cents,
                reason,
            })
            .send()
            .await
            .map_err(|e| {
                AppError::ExternalProcessorError(anyhow::anyhow!("Refund request failed: {}", e))
            })?;

        timer.observe_duration();

        if response.status().is_success() {
            let refund: ProcessorRefund = response.json().await.map_err(|e| {
                AppError::ExternalProcessorError(anyhow::anyhow!(
                    "Malformed refund response: {}",
                    e
                ))
            })?;
            tracing::info!(refund_id = %refund.id, status = %refund.status, "Processor refund succeeded");
            Ok(refund)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ProcessorErrorBody>(&body)
                .map(|b| format!("{}: {}", b.error.code, b.error.description))
                .unwrap_or(body);
            Err(AppError::ExternalProcessorError(anyhow::anyhow!(
                "Processor returned {}: {}",
                status,
                detail
            )))
        }
    }
}
