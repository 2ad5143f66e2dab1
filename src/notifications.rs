//! Proactive prompt delivery
//!
//! The orchestrator hands every proactive prompt to a [`NotificationService`].
//! Delivery is outside the pipeline; these implementations either log the
//! prompt or keep it in a bounded local queue for the caller to drain.

use crate::utils::current_timestamp;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

const MAX_NOTIFICATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub id: String,
    pub user_id: String,
    pub timestamp: u64,
    pub prompt: String,
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn enqueue(&self, user_id: &str, prompt: &str) -> Result<()>;
}

/// Writes prompts to the log and nothing else
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationService for LoggingNotifier {
    async fn enqueue(&self, user_id: &str, prompt: &str) -> Result<()> {
        tracing::info!(user_id, "Proactive prompt queued: {}", prompt);
        Ok(())
    }
}

/// Bounded in-process queue; the oldest entries drop first
#[derive(Debug, Default)]
pub struct QueueNotifier {
    entries: RwLock<Vec<NotificationEntry>>,
}

impl QueueNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<NotificationEntry> {
        self.entries.read().map(|l| l.clone()).unwrap_or_default()
    }

    /// Remove and return everything queued for one user
    pub fn drain(&self, user_id: &str) -> Vec<NotificationEntry> {
        let Ok(mut list) = self.entries.write() else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) =
            list.drain(..).partition(|entry| entry.user_id == user_id);
        *list = kept;
        taken
    }
}

#[async_trait]
impl NotificationService for QueueNotifier {
    async fn enqueue(&self, user_id: &str, prompt: &str) -> Result<()> {
        let timestamp = current_timestamp();
        let entry = NotificationEntry {
            id: format!("note_{}_{}", timestamp, uuid::Uuid::new_v4().simple()),
            user_id: user_id.to_string(),
            timestamp,
            prompt: prompt.to_string(),
        };

        let mut list = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("notification queue poisoned"))?;
        list.push(entry);
        if list.len() > MAX_NOTIFICATIONS {
            let overflow = list.len() - MAX_NOTIFICATIONS;
            list.drain(0..overflow);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_drains_per_user() {
        let queue = QueueNotifier::new();
        queue.enqueue("a", "hello a").await.unwrap();
        queue.enqueue("b", "hello b").await.unwrap();

        let drained = queue.drain("a");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].prompt, "hello a");
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.pending()[0].user_id, "b");
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let queue = QueueNotifier::new();
        for i in 0..(MAX_NOTIFICATIONS + 5) {
            queue.enqueue("u", &i.to_string()).await.unwrap();
        }
        let pending = queue.pending();
        assert_eq!(pending.len(), MAX_NOTIFICATIONS);
        assert_eq!(pending[0].prompt, "5");
    }

    #[tokio::test]
    async fn test_logging_notifier_accepts() {
        assert!(LoggingNotifier.enqueue("u", "hi").await.is_ok());
    }
}
