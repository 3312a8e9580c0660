//! Notification transports.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{AdapterError, Notifier};

/// Posts notifications as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, kind: &str, payload: &serde_json::Value) -> Result<(), AdapterError> {
        let body = json!({
            "kind": kind,
            "payload": payload,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::NotifyFailed {
                kind: kind.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(kind, status = %status, "Webhook rejected notification");
            return Err(AdapterError::NotifyFailed {
                kind: kind.to_string(),
                reason: format!("HTTP {}: {}", status, text),
            });
        }

        info!(kind, "Notification delivered");
        Ok(())
    }
}

/// Notifier that only writes to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: &str, payload: &serde_json::Value) -> Result<(), AdapterError> {
        info!(kind, payload = %payload, "Notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        let notifier = LogNotifier;
        let result = notifier
            .notify("daily_report", &json!({"date": "2024-07-05"}))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_unreachable() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook");
        let err = notifier
            .notify("stage_failure", &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stage_failure"));
    }
}
