//! Outbound message delivery.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A templated message addressed to one contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub workspace_id: String,
    pub contact_email: String,
    pub template_id: String,
    pub automation_id: String,
    pub run_id: String,
    pub node_id: String,
    /// Template data: the run's triggering event.
    pub context: Value,
}

#[derive(Debug, Deserialize)]
struct DeliveryReceipt {
    #[serde(default)]
    message_id: Option<String>,
}

/// Delivers messages for email nodes and returns the provider message id.
///
/// Implementations report retryable problems as [`Error::Execution`] and
/// problems a retry cannot fix as [`Error::Configuration`].
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<String>;
}

/// Posts each message as JSON to a delivery endpoint.
pub struct HttpMessageSender {
    client: Client,
    endpoint: String,
}

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

impl HttpMessageSender {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MessageSender for HttpMessageSender {
    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        debug!(
            to = %message.contact_email,
            template_id = %message.template_id,
            "Posting message to delivery endpoint"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| Error::Execution(format!("Delivery request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            // Endpoints that do not return a receipt still get a traceable id.
            let receipt = response
                .json::<DeliveryReceipt>()
                .await
                .ok()
                .and_then(|r| r.message_id);
            return Ok(receipt.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

/// Client errors other than timeouts and throttling will fail the same way
/// on every attempt.
fn classify_status(status: StatusCode, body: &str) -> Error {
    let message = format!("Delivery endpoint returned {}: {}", status, body);
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        Error::Configuration(message)
    } else {
        Error::Execution(message)
    }
}

/// Sender that only logs. Used when no delivery endpoint is configured.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, message: &OutboundMessage) -> Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        info!(
            to = %message.contact_email,
            template_id = %message.template_id,
            automation_id = %message.automation_id,
            run_id = %message.run_id,
            message_id = %message_id,
            "Sending message"
        );
        Ok(message_id)
    }
}
