//! Outbound notification seam for verification and reset tokens.
//!
//! Delivery is somebody else's job. `LogNotifier` is the local default and
//! `MemoryNotifier` lets tests read what would have been sent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use super::AuthError;
use crate::models::OneTimePurpose;

/// A single-use token ready to be delivered to its owner.
#[derive(Clone)]
pub struct Notification {
    pub to_email: String,
    pub purpose: OneTimePurpose,
    /// Raw token secret. Never log this.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("to_email", &self.to_email)
            .field("purpose", &self.purpose)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Delivery abstraction for single-use tokens.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), AuthError>;
}

/// Logs the recipient and purpose; drops the message.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: Notification) -> Result<(), AuthError> {
        info!(
            to_email = %notification.to_email,
            purpose = %notification.purpose,
            expires_at = %notification.expires_at,
            "notification send stub"
        );
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }

    /// Most recent token sent to `email` for `purpose`.
    pub async fn latest_token(&self, email: &str, purpose: OneTimePurpose) -> Option<String> {
        self.sent
            .lock()
            .await
            .iter()
            .rev()
            .find(|n| n.to_email == email && n.purpose == purpose)
            .map(|n| n.token.clone())
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: Notification) -> Result<(), AuthError> {
        self.sent.lock().await.push(notification);
        Ok(())
    }
}
