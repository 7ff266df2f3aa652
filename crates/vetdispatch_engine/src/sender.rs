//! Outbound notification transport.
//!
//! The engine treats every sender as unreliable: each call is wrapped in a
//! delivery log row, a timeout and a bounded retry by the fan-out.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// One rendered message ready to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Permanent refusal (bad address, relay said no); not retried
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Rejected(_))
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError>;
}

/// Writes messages to the log instead of sending them. Development default.
#[derive(Debug, Default, Clone)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError> {
        info!(
            to = %email.to,
            subject = %email.subject,
            "Notification (log sender)\n{}",
            email.text_body
        );
        Ok(())
    }
}

/// POSTs each message as JSON to a mail relay.
///
/// 2xx is success, 4xx is a permanent rejection, anything else is retryable.
#[derive(Clone)]
pub struct WebhookSender {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SendError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(email)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!("relay returned {}: {}", status, truncate(&body, 200));
        if status.is_client_error() {
            Err(SendError::Rejected(detail))
        } else {
            Err(SendError::Transport(detail))
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
