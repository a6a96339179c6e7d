//! Notification drivers.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{NotificationDriver, NotificationMessage, SendReceipt};

/// `generic` driver: POST the message as JSON to `config.endpoint`
pub struct WebhookDriver {
    client: reqwest::Client,
}

impl Default for WebhookDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(config: &serde_json::Value) -> Option<&str> {
        config
            .get("endpoint")
            .and_then(|e| e.as_str())
            .filter(|e| e.starts_with("http://") || e.starts_with("https://"))
    }
}

#[async_trait]
impl NotificationDriver for WebhookDriver {
    fn name(&self) -> &str {
        "generic"
    }

    fn validate_config(&self, config: &serde_json::Value) -> bool {
        Self::endpoint(config).is_some()
    }

    async fn send(&self, message: &NotificationMessage, config: &serde_json::Value) -> Result<SendReceipt> {
        let endpoint = Self::endpoint(config).context("webhook endpoint missing or invalid")?;
        let timeout = config
            .get("timeout_seconds")
            .and_then(|t| t.as_u64())
            .unwrap_or(10);

        let mut request = self
            .client
            .post(endpoint)
            .timeout(Duration::from_secs(timeout))
            .json(message);

        if let Some(headers) = config.get("headers").and_then(|h| h.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to POST notification to {}", endpoint))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook returned {}", status);
        }

        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Ok(SendReceipt {
            status: "sent".to_string(),
            message_id,
        })
    }
}

/// `log` driver: write the message to the structured log
#[derive(Debug, Default)]
pub struct LogDriver;

#[async_trait]
impl NotificationDriver for LogDriver {
    fn name(&self) -> &str {
        "log"
    }

    fn validate_config(&self, _config: &serde_json::Value) -> bool {
        true
    }

    async fn send(&self, message: &NotificationMessage, _config: &serde_json::Value) -> Result<SendReceipt> {
        let message_id = Uuid::new_v4().to_string();
        info!(
            %message_id,
            trace_id = %message.trace_id,
            run_id = %message.run_id,
            severity = %message.severity,
            incident_id = ?message.incident_id,
            title = %message.title,
            body = %message.body,
            "Notification"
        );

        Ok(SendReceipt {
            status: "logged".to_string(),
            message_id: Some(message_id),
        })
    }
}
