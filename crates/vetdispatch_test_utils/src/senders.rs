//! Notification senders for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vetdispatch_engine::{NotificationSender, OutboundEmail, SendError};

/// Records every message it is asked to send. Never fails.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundEmail>>,
    delay: Option<Duration>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleep before each send, to keep messages in flight while a race runs.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn sent_to(&self, address: &str) -> Vec<OutboundEmail> {
        self.lock()
            .iter()
            .filter(|email| email.to == address)
            .cloned()
            .collect()
    }

    /// Messages whose subject starts with `prefix`.
    pub fn with_subject(&self, prefix: &str) -> Vec<OutboundEmail> {
        self.lock()
            .iter()
            .filter(|email| email.subject.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutboundEmail>> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().push(email.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum FailureMode {
    /// Every send fails with a retryable transport error
    Transport,
    /// Sends to these addresses are permanently rejected; others succeed
    Reject(HashSet<String>),
    /// The first `n` sends fail with a transport error, the rest succeed
    FailFirst(u32),
}

/// Fails on purpose; successful sends are recorded like [`RecordingSender`].
pub struct FailingSender {
    mode: FailureMode,
    calls: AtomicU32,
    failures_left: AtomicU32,
    delivered: RecordingSender,
}

impl FailingSender {
    pub fn new(mode: FailureMode) -> Arc<Self> {
        let failures_left = match &mode {
            FailureMode::FailFirst(n) => *n,
            _ => 0,
        };
        Arc::new(Self {
            mode,
            calls: AtomicU32::new(0),
            failures_left: AtomicU32::new(failures_left),
            delivered: RecordingSender::default(),
        })
    }

    pub fn reject(addresses: &[&str]) -> Arc<Self> {
        Self::new(FailureMode::Reject(
            addresses.iter().map(|a| a.to_string()).collect(),
        ))
    }

    /// Total send calls, retries included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<OutboundEmail> {
        self.delivered.sent()
    }
}

#[async_trait]
impl NotificationSender for FailingSender {
    async fn send(&self, email: &OutboundEmail) -> Result<(), SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            FailureMode::Transport => {
                return Err(SendError::Transport("connection refused".into()));
            }
            FailureMode::Reject(addresses) if addresses.contains(&email.to) => {
                return Err(SendError::Rejected(format!("mailbox {} does not exist", email.to)));
            }
            FailureMode::Reject(_) => {}
            FailureMode::FailFirst(_) => {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(SendError::Transport("connection reset by peer".into()));
                }
            }
        }
        self.delivered.send(email).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail {
            to: to.into(),
            to_name: None,
            subject: "New Cow case in Lahore".into(),
            html_body: String::new(),
            text_body: String::new(),
        }
    }

    #[tokio::test]
    async fn test_fail_first_then_succeed() {
        let sender = FailingSender::new(FailureMode::FailFirst(2));
        assert!(sender.send(&email("a@test")).await.is_err());
        assert!(sender.send(&email("a@test")).await.is_err());
        assert!(sender.send(&email("a@test")).await.is_ok());
        assert_eq!(sender.calls(), 3);
        assert_eq!(sender.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_recording_filters() {
        let sender = RecordingSender::new();
        sender.send(&email("a@test")).await.unwrap();
        sender.send(&email("b@test")).await.unwrap();
        assert_eq!(sender.count(), 2);
        assert_eq!(sender.sent_to("b@test").len(), 1);
        assert_eq!(sender.with_subject("New Cow").len(), 2);
    }
}
