//! User notifications
//!
//! Delivery is fire-and-forget: a failed notification is logged and never
//! interrupts the loop that raised it.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::store::SqliteStore;
use crate::types::UserId;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user_id: UserId, message: &str);
}

/// Writes notifications to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user(&self, user_id: UserId, message: &str) {
        info!(user = user_id, "notify: {}", message);
    }
}

/// Appends notifications to the `notifications` table for the chat front-end
#[derive(Clone)]
pub struct OutboxNotifier {
    store: SqliteStore,
}

impl OutboxNotifier {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn notify_user(&self, user_id: UserId, message: &str) {
        if let Err(e) = self.store.enqueue_notification(user_id, message, Utc::now()) {
            warn!(user = user_id, "Failed to queue notification: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbox_persists_messages() {
        let store = SqliteStore::open_in_memory().unwrap();
        let notifier = OutboxNotifier::new(store.clone());
        notifier.notify_user(5, "position closed").await;
        notifier.notify_user(5, "rollback executed").await;
        assert_eq!(
            store.pending_notifications(5).unwrap(),
            vec!["position closed".to_string(), "rollback executed".to_string()]
        );
        assert!(store.pending_notifications(6).unwrap().is_empty());
    }
}
