//! Notification events.
//!
//! Business events handed to the engine by order, booking and payment
//! workflows, plus the catalogue of event types the engine accepts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static metadata about a supported notification event type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NotificationEventTypeInfo {
    /// Canonical key (snake_case).
    pub event_type: &'static str,
    /// Human-friendly label, also the fallback email subject.
    pub label: &'static str,
    /// Additional accepted spellings.
    pub aliases: &'static [&'static str],
    /// Priority used when the event does not override it.
    pub default_priority: NotificationPriority,
}

const NOTIFICATION_EVENT_TYPES: &[NotificationEventTypeInfo] = &[
    NotificationEventTypeInfo {
        event_type: "order_status_changed",
        label: "Order Status Changed",
        aliases: &["order.status_changed", "order.updated", "OrderStatusChanged"],
        default_priority: NotificationPriority::Normal,
    },
    NotificationEventTypeInfo {
        event_type: "order_cancelled",
        label: "Order Cancelled",
        aliases: &["order.cancelled", "order.canceled", "OrderCancelled"],
        default_priority: NotificationPriority::High,
    },
    NotificationEventTypeInfo {
        event_type: "booking_created",
        label: "Booking Created",
        aliases: &["booking.created", "BookingCreated"],
        default_priority: NotificationPriority::Normal,
    },
    NotificationEventTypeInfo {
        event_type: "booking_updated",
        label: "Booking Updated",
        aliases: &["booking.updated", "BookingUpdated"],
        default_priority: NotificationPriority::Normal,
    },
    NotificationEventTypeInfo {
        event_type: "booking_cancelled",
        label: "Booking Cancelled",
        aliases: &["booking.cancelled", "booking.canceled", "BookingCancelled"],
        default_priority: NotificationPriority::High,
    },
    NotificationEventTypeInfo {
        event_type: "payment_succeeded",
        label: "Payment Received",
        aliases: &["payment.succeeded", "payment.success", "PaymentSucceeded"],
        default_priority: NotificationPriority::Normal,
    },
    NotificationEventTypeInfo {
        event_type: "payment_failed",
        label: "Payment Failed",
        aliases: &["payment.failed", "PaymentFailed"],
        default_priority: NotificationPriority::High,
    },
    NotificationEventTypeInfo {
        event_type: "payout_sent",
        label: "Payout Sent",
        aliases: &["payout.sent", "PayoutSent"],
        default_priority: NotificationPriority::Normal,
    },
    NotificationEventTypeInfo {
        event_type: "merchant_alert",
        label: "Merchant Alert",
        aliases: &["merchant.alert", "MerchantAlert"],
        default_priority: NotificationPriority::Critical,
    },
    NotificationEventTypeInfo {
        event_type: "driver_assigned",
        label: "Driver Assigned",
        aliases: &["driver.assigned", "DriverAssigned"],
        default_priority: NotificationPriority::Normal,
    },
];

pub fn notification_event_types() -> &'static [NotificationEventTypeInfo] {
    NOTIFICATION_EVENT_TYPES
}

/// Catalogue entry for any accepted spelling of an event type.
pub fn event_type_info(input: &str) -> Option<&'static NotificationEventTypeInfo> {
    let normalized = normalize_event_key(input);
    if normalized.is_empty() {
        return None;
    }

    NOTIFICATION_EVENT_TYPES.iter().find(|info| {
        normalize_event_key(info.event_type) == normalized
            || info
                .aliases
                .iter()
                .any(|alias| normalize_event_key(alias) == normalized)
    })
}

/// Canonical snake_case key for any accepted spelling of an event type.
pub fn canonicalize_event_type(input: &str) -> Option<&'static str> {
    event_type_info(input).map(|info| info.event_type)
}

fn normalize_event_key(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !matches!(c, '_' | '.' | '-' | ' '))
        .collect()
}

/// Priority level for notifications.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    /// Fans out across the critical channel list.
    Critical,
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// References from an event back into the business domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    /// User-facing notification row this event belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
}

/// A business event to deliver. Consumed once by intake; its persisted
/// trace is the delivery attempts it spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Business user id of the recipient.
    pub recipient_id: String,
    /// Explicit channel request; bypasses routing when set.
    #[serde(default)]
    pub channel_hint: Option<String>,
    pub event_type: String,
    /// Overrides the catalogue default priority.
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
    #[serde(default)]
    pub context: ContextRefs,
    /// Template parameters keyed by placeholder name.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Caller-rendered body used when no template exists.
    #[serde(default)]
    pub rendered_content: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

impl NotificationEvent {
    pub fn new(recipient_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            channel_hint: None,
            event_type: event_type.into(),
            priority: None,
            context: ContextRefs::default(),
            parameters: BTreeMap::new(),
            rendered_content: None,
            subject: None,
        }
    }

    pub fn with_channel_hint(mut self, channel: impl Into<String>) -> Self {
        self.channel_hint = Some(channel.into());
        self
    }

    pub fn with_priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.context.order_id = Some(order_id.into());
        self
    }

    pub fn with_booking(mut self, booking_id: impl Into<String>) -> Self {
        self.context.booking_id = Some(booking_id.into());
        self
    }

    pub fn with_payment(mut self, payment_id: impl Into<String>) -> Self {
        self.context.payment_id = Some(payment_id.into());
        self
    }

    pub fn for_notification(mut self, notification_id: impl Into<String>) -> Self {
        self.context.notification_id = Some(notification_id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.rendered_content = Some(content.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Effective priority: the override, else the catalogue default.
    pub fn effective_priority(&self) -> NotificationPriority {
        self.priority.unwrap_or_else(|| {
            event_type_info(&self.event_type)
                .map(|info| info.default_priority)
                .unwrap_or_default()
        })
    }

    /// Parameters merged with context ids, so templates can reference
    /// `{order_id}` and friends without the caller repeating them.
    pub fn template_values(&self) -> BTreeMap<String, String> {
        let mut values = self.parameters.clone();
        let refs = [
            ("order_id", &self.context.order_id),
            ("booking_id", &self.context.booking_id),
            ("payment_id", &self.context.payment_id),
        ];
        for (key, value) in refs {
            if let Some(value) = value {
                values
                    .entry(key.to_string())
                    .or_insert_with(|| value.clone());
            }
        }
        values
    }
}
