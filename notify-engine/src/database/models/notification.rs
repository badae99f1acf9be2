//! Notification database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

use super::DeliveryChannel;

/// User-facing notification database model.
/// Owned by the business domain; the engine only flips `read_status`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub user_id: String,
    pub notification_type: String,
    pub message: String,
    pub read_status: bool,
    pub related_order_id: Option<String>,
    pub related_booking_id: Option<String>,
    pub created_at: i64,
    pub read_at: Option<i64>,
}

impl NotificationDbModel {
    pub fn new(
        user_id: impl Into<String>,
        notification_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            notification_type: notification_type.into(),
            message: message.into(),
            read_status: false,
            related_order_id: None,
            related_booking_id: None,
            created_at: now_ms(),
            read_at: None,
        }
    }
}

/// Notification template database model.
/// Keyed by `(notification_type, channel)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationTemplateDbModel {
    pub id: String,
    pub name: String,
    pub notification_type: String,
    pub channel: String,
    /// Body with `{placeholder}` markers.
    pub body: String,
    pub subject: Option<String>,
    /// Provider-side template identifier (CHAT_TEMPLATED).
    pub provider_template_ref: Option<String>,
    pub language: Option<String>,
    pub created_at: i64,
}

impl NotificationTemplateDbModel {
    pub fn new(
        name: impl Into<String>,
        notification_type: impl Into<String>,
        channel: DeliveryChannel,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            notification_type: notification_type.into(),
            channel: channel.as_str().to_string(),
            body: body.into(),
            subject: None,
            provider_template_ref: None,
            language: None,
            created_at: now_ms(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_provider_template(
        mut self,
        template_ref: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        self.provider_template_ref = Some(template_ref.into());
        self.language = Some(language.into());
        self
    }
}

/// Delivery audit database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryAuditDbModel {
    pub id: String,
    pub attempt_id: Option<String>,
    /// Action: INTAKE_REJECTED, REDRIVE
    pub action: String,
    pub actor: String,
    /// JSON blob describing the action.
    pub detail: String,
    pub created_at: i64,
}

impl DeliveryAuditDbModel {
    pub fn new(
        attempt_id: Option<String>,
        action: AuditAction,
        actor: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id,
            action: action.as_str().to_string(),
            actor: actor.into(),
            detail: detail.into(),
            created_at: now_ms(),
        }
    }
}

/// Audited actions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Event rejected at intake (unsupported channel).
    IntakeRejected,
    /// Operator moved a PERMANENTLY_FAILED row back to PENDING.
    Redrive,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntakeRejected => "INTAKE_REJECTED",
            Self::Redrive => "REDRIVE",
        }
    }
}
