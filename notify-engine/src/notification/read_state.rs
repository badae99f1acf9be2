//! Read-state façade: surfaces delivered attempts to the recipient's live
//! sessions and records in-app acknowledgements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::models::DeliveryAttemptDbModel;
use crate::database::repositories::NotificationRepository;
use crate::database::time::{ms_to_datetime, now_ms};

/// Broadcast capacity for real-time delivery events.
const REALTIME_CHANNEL_CAPACITY: usize = 256;

/// Real-time event pushed to a user's session room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub user_id: String,
    pub notification_id: Option<String>,
    pub attempt_id: String,
    pub channel: String,
    pub event_type: String,
    /// In-app message text, when the notification row exists.
    pub message: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

/// Sink for real-time events, implemented by the session-room collaborator.
#[async_trait]
pub trait SessionPublisher: Send + Sync {
    async fn publish(&self, event: RealtimeEvent) -> Result<()>;
}

/// [`SessionPublisher`] over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSessionPublisher {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastSessionPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSessionPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionPublisher for BroadcastSessionPublisher {
    async fn publish(&self, event: RealtimeEvent) -> Result<()> {
        // No live session is not an error.
        if self.tx.send(event).is_err() {
            debug!("No realtime subscribers for delivery event");
        }
        Ok(())
    }
}

/// Bridges delivery outcomes and the user-facing notification record.
pub struct ReadStateFacade {
    notifications: Arc<dyn NotificationRepository>,
    publisher: Arc<dyn SessionPublisher>,
}

impl ReadStateFacade {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        publisher: Arc<dyn SessionPublisher>,
    ) -> Self {
        Self {
            notifications,
            publisher,
        }
    }

    /// Push a delivered attempt to the recipient's sessions.
    ///
    /// Best-effort: failures are logged and never touch delivery status.
    pub async fn on_delivered(&self, attempt: &DeliveryAttemptDbModel) {
        let message = match attempt.notification_ref.as_deref() {
            Some(id) => match self.notifications.get_notification(id).await {
                Ok(notification) => Some(notification.message),
                Err(e) => {
                    warn!(attempt_id = %attempt.id, notification_id = %id, error = %e, "Notification lookup failed");
                    None
                }
            },
            None => None,
        };

        let event = RealtimeEvent {
            user_id: attempt.recipient_user_id.clone(),
            notification_id: attempt.notification_ref.clone(),
            attempt_id: attempt.id.clone(),
            channel: attempt.channel.clone(),
            event_type: attempt.event_type.clone(),
            message,
            delivered_at: ms_to_datetime(attempt.updated_at),
        };

        if let Err(e) = self.publisher.publish(event).await {
            warn!(attempt_id = %attempt.id, error = %e, "Failed to publish delivery event");
        }
    }

    /// Mark a notification as read. Independent of any delivery outcome;
    /// repeated calls are no-ops.
    pub async fn on_user_acknowledged(&self, notification_id: &str) -> Result<()> {
        if self.notifications.mark_read(notification_id, now_ms()).await? {
            info!(notification_id = %notification_id, "Notification acknowledged");
        } else {
            debug!(notification_id = %notification_id, "Notification already read");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: &str) -> RealtimeEvent {
        RealtimeEvent {
            user_id: user.to_string(),
            notification_id: None,
            attempt_id: "a-1".to_string(),
            channel: "CHAT".to_string(),
            event_type: "order_status_changed".to_string(),
            message: None,
            delivered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastSessionPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.publish(event("u-1")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().user_id, "u-1");
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let publisher = BroadcastSessionPublisher::default();
        assert!(publisher.publish(event("u-1")).await.is_ok());
    }
}
