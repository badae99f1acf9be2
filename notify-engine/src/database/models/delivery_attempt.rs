//! Delivery attempt database models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, now_ms};

/// Delivery attempt database model.
/// One persisted record of delivery for one (recipient, channel) pair.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAttemptDbModel {
    pub id: String,
    /// Back-reference to the user-facing `notification` row, if any.
    pub notification_ref: Option<String>,
    /// Business user id of the recipient.
    pub recipient_user_id: String,
    /// Channel: CHAT, CHAT_TEMPLATED, EMAIL, SMS
    pub channel: String,
    /// Channel-addressable recipient (phone number, email address).
    pub recipient: String,
    /// Canonical notification event type.
    pub event_type: String,
    pub template_ref: Option<String>,
    pub template_name: Option<String>,
    /// Provider template language (CHAT_TEMPLATED).
    pub template_language: Option<String>,
    /// JSON array of ordered template parameters.
    pub rendered_parameters: Option<String>,
    /// Email subject line (EMAIL only).
    pub subject: Option<String>,
    /// Final rendered body; NULL for template-only messages.
    pub content: Option<String>,
    /// Status: PENDING, SENT, FAILED, PERMANENTLY_FAILED
    pub status: String,
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: i32,
    /// Epoch ms; set only while FAILED with retries remaining.
    pub next_retry_at: Option<i64>,
    pub delivery_provider: Option<String>,
    /// JSON blob of provider diagnostics.
    pub delivery_metadata: Option<String>,
    /// JSON blob of business context references (order, booking, payment).
    pub context_refs: String,
    /// Epoch ms when an executor claimed the row.
    pub claimed_at: Option<i64>,
    pub claim_token: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeliveryAttemptDbModel {
    pub fn new(
        channel: DeliveryChannel,
        recipient_user_id: impl Into<String>,
        recipient: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_ref: None,
            recipient_user_id: recipient_user_id.into(),
            channel: channel.as_str().to_string(),
            recipient: recipient.into(),
            event_type: event_type.into(),
            template_ref: None,
            template_name: None,
            template_language: None,
            rendered_parameters: None,
            subject: None,
            content: None,
            status: DeliveryStatus::Pending.as_str().to_string(),
            provider_message_id: None,
            last_error: None,
            retry_count: 0,
            next_retry_at: None,
            delivery_provider: None,
            delivery_metadata: None,
            context_refs: "{}".to_string(),
            claimed_at: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> Option<DeliveryStatus> {
        DeliveryStatus::parse(&self.status)
    }

    pub fn delivery_channel(&self) -> Option<DeliveryChannel> {
        DeliveryChannel::parse(&self.channel)
    }

    pub fn created_at_datetime(&self) -> DateTime<Utc> {
        ms_to_datetime(self.created_at)
    }

    pub fn next_retry_at_datetime(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at.map(ms_to_datetime)
    }

    /// Ordered template parameters, empty when absent or malformed.
    pub fn parameters(&self) -> Vec<String> {
        self.rendered_parameters
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(|s| s.is_terminal())
    }
}

/// Delivery channel kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryChannel {
    /// Free-form chat-app message.
    Chat,
    /// Pre-approved chat-app template message.
    ChatTemplated,
    Email,
    Sms,
}

impl DeliveryChannel {
    pub const ALL: [DeliveryChannel; 4] = [Self::Chat, Self::ChatTemplated, Self::Email, Self::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::ChatTemplated => "CHAT_TEMPLATED",
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }

    /// Parse a channel name, tolerating case and `-`/`_` differences.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "CHAT" => Some(Self::Chat),
            "CHAT_TEMPLATED" => Some(Self::ChatTemplated),
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            _ => None,
        }
    }

    /// Whether the channel addresses recipients by phone number.
    pub fn uses_phone_address(&self) -> bool {
        !matches!(self, Self::Email)
    }
}

/// Delivery status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Row created, first attempt not yet resolved.
    Pending,
    /// Provider accepted the message.
    Sent,
    /// Transient failure; a retry is scheduled.
    Failed,
    /// No further attempts will be made.
    PermanentlyFailed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            "PERMANENTLY_FAILED" => Some(Self::PermanentlyFailed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::PermanentlyFailed)
    }

    /// Whether an executor may move a row from `self` to `next`.
    ///
    /// Administrative re-drive (PERMANENTLY_FAILED -> PENDING) is not an
    /// executor transition and is handled by the repository separately.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Sent | Self::Failed | Self::PermanentlyFailed) => true,
            (Self::Failed, Self::Sent | Self::Failed | Self::PermanentlyFailed) => true,
            _ => false,
        }
    }
}

/// Aggregate row counts per delivery status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub permanently_failed: u64,
}

impl DeliveryStatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.failed + self.permanently_failed
    }
}

/// Filters for querying delivery attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryAttemptFilter {
    pub status: Option<DeliveryStatus>,
    pub recipient: Option<String>,
    pub template_name: Option<String>,
    /// Inclusive lower bound on `created_at` (epoch ms).
    pub created_from: Option<i64>,
    /// Exclusive upper bound on `created_at` (epoch ms).
    pub created_to: Option<i64>,
    pub min_retry_count: Option<i32>,
}

impl DeliveryAttemptFilter {
    pub fn with_status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_template_name(mut self, template_name: impl Into<String>) -> Self {
        self.template_name = Some(template_name.into());
        self
    }

    pub fn created_between(mut self, from: Option<i64>, to: Option<i64>) -> Self {
        self.created_from = from;
        self.created_to = to;
        self
    }

    pub fn with_min_retry_count(mut self, retry_count: i32) -> Self {
        self.min_retry_count = Some(retry_count);
        self
    }
}

/// Pagination parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!(DeliveryChannel::parse("EMAIL"), Some(DeliveryChannel::Email));
        assert_eq!(
            DeliveryChannel::parse("chat-templated"),
            Some(DeliveryChannel::ChatTemplated)
        );
        assert_eq!(DeliveryChannel::parse(" sms "), Some(DeliveryChannel::Sms));
        assert_eq!(DeliveryChannel::parse("PIGEON"), None);
        assert_eq!(DeliveryChannel::ChatTemplated.to_string(), "CHAT_TEMPLATED");
    }

    #[test]
    fn test_terminal_statuses_never_transition() {
        for terminal in [DeliveryStatus::Sent, DeliveryStatus::PermanentlyFailed] {
            assert!(terminal.is_terminal());
            for next in [
                DeliveryStatus::Pending,
                DeliveryStatus::Sent,
                DeliveryStatus::Failed,
                DeliveryStatus::PermanentlyFailed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_retry_transitions() {
        assert!(DeliveryStatus::Failed.can_transition_to(DeliveryStatus::Failed));
        assert!(DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Sent));
        assert!(!DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Pending));
        assert!(!DeliveryStatus::Failed.can_transition_to(DeliveryStatus::Pending));
    }

    #[test]
    fn test_new_attempt_defaults() {
        let attempt =
            DeliveryAttemptDbModel::new(DeliveryChannel::Sms, "user-1", "+15550001", "order_cancelled");
        assert_eq!(attempt.status(), Some(DeliveryStatus::Pending));
        assert_eq!(attempt.retry_count, 0);
        assert!(attempt.next_retry_at.is_none());
        assert!(attempt.parameters().is_empty());
        assert_eq!(attempt.context_refs, "{}");
    }
}
