use crate::model::{AlarmRecord, AlarmType, Measurement};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),

    #[error("Notification channel unavailable: {0}")]
    ChannelUnavailable(String),
}

/// A message for a human about an alarm transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipient: String,
}

impl Notification {
    /// Source entered WARNING or DANGER.
    pub fn raised(alarm: &AlarmRecord, source_id: &str, recipient: &str) -> Self {
        let subject = match alarm.alarm_type {
            AlarmType::Danger => format!("CRITICAL: CO at {} ppm on {}", alarm.co_level, source_id),
            AlarmType::Warning => format!("Warning: CO at {} ppm on {}", alarm.co_level, source_id),
        };
        let body = format!(
            "{}\nSource: {}\nTime: {}",
            alarm.message,
            source_id,
            alarm.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );

        Self {
            subject,
            body,
            recipient: recipient.to_string(),
        }
    }

    /// Source returned to NORMAL after an alarm.
    pub fn cleared(measurement: &Measurement, recipient: &str) -> Self {
        Self {
            subject: format!("CO back to normal on {}", measurement.source_id),
            body: format!(
                "CO level is safe again: {} ppm\nSource: {}\nTime: {}",
                measurement.co_level,
                measurement.source_id,
                measurement.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            recipient: recipient.to_string(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification. Callers treat failures as best-effort.
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        warn!(
            recipient = %notification.recipient,
            "{}: {}",
            notification.subject,
            notification.body.replace('\n', " | ")
        );
        Ok(())
    }
}

/// Posts notifications as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// The client times out after 5 seconds, covering connect and response.
    pub fn new(url: String) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                NotificationError::ChannelUnavailable(format!("cannot build HTTP client: {}", e))
            })?;

        Ok(Self { url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| NotificationError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotificationError::SendFailed(format!(
                "webhook responded with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
