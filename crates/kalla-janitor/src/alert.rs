//! Alert delivery: webhook client, or the log when no webhook is configured.

use async_trait::async_trait;
use kalla_reaper::registry::CollaboratorResult;
use kalla_reaper::{AlertSender, CollaboratorError};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Posts alerts as JSON to a mail relay webhook.
pub struct WebhookAlertSender {
    http: reqwest::Client,
    url: url::Url,
}

impl WebhookAlertSender {
    pub fn new(url: url::Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl AlertSender for WebhookAlertSender {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> CollaboratorResult<()> {
        self.http
            .post(self.url.clone())
            .json(&AlertPayload {
                recipient,
                subject,
                body,
            })
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| CollaboratorError::unavailable("alert webhook", e))?;
        Ok(())
    }
}

/// Writes alerts to the log. Used when no webhook is configured.
pub struct LogAlertSender;

#[async_trait]
impl AlertSender for LogAlertSender {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> CollaboratorResult<()> {
        warn!("Alert for {}: {}\n{}", recipient, subject, body);
        Ok(())
    }
}
