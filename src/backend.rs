//! Backend client — the relay's single outbound call.
//!
//! One POST per forward attempt. Everything that can go wrong on the wire
//! (connect, timeout, non-2xx, undecodable body) surfaces as a
//! `BackendError`; turning that into a recorded outcome is the forward
//! stage's business, not the client's.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BackendError;
use crate::pipeline::types::DeliveryStatus;

/// How much response body to keep in a non-2xx error.
const ERROR_BODY_LIMIT: usize = 200;

// ── Wire types ──────────────────────────────────────────────────────

/// JSON body POSTed to the bot endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Originating address of the relayed message.
    pub address: String,
    /// Message body, verbatim.
    pub body: String,
    /// Credential identifying this relay.
    pub sender_key: String,
    /// Classification token from the first matched rule.
    pub type_key: String,
}

/// JSON body the bot endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardResponse {
    /// Outcome token: "success", "partial_success", anything else is a
    /// failure.
    pub result: String,
    /// Human-readable outcome detail, stored on the record.
    pub result_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_recipients: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
}

impl ForwardResponse {
    /// Map the backend's result token onto the record state machine.
    ///
    /// Unknown tokens count as failure — the state machine has no "maybe".
    pub fn delivery_status(&self) -> DeliveryStatus {
        match self.result.as_str() {
            "success" => DeliveryStatus::Success,
            "partial_success" => DeliveryStatus::PartialSuccess,
            other => {
                warn!(result = %other, "Unknown backend result token, recording failure");
                DeliveryStatus::Failure
            }
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// The outbound seam. Swapped for a double in tests.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Submit one forwarding request to the given endpoint.
    async fn forward(
        &self,
        bot_url: &str,
        request: &ForwardRequest,
    ) -> Result<ForwardResponse, BackendError>;
}

/// reqwest-backed client with a per-call timeout.
pub struct HttpBackendClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBackendClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn forward(
        &self,
        bot_url: &str,
        request: &ForwardRequest,
    ) -> Result<ForwardResponse, BackendError> {
        debug!(url = %bot_url, type_key = %request.type_key, "Submitting forward request");

        let response = self
            .client
            .post(bot_url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: snippet,
            });
        }

        response
            .json::<ForwardResponse>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}
