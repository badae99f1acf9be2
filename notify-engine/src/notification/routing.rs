//! Recipient lookup and channel routing.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::database::models::DeliveryChannel;
use crate::{Error, Result};

use super::channels::ChannelRegistry;
use super::events::{NotificationEvent, NotificationPriority};

/// Marketplace role of a recipient.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecipientRole {
    #[default]
    Customer,
    Merchant,
    Driver,
    Staff,
}

/// Contact details for one business user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientContact {
    pub user_id: String,
    #[serde(default)]
    pub role: RecipientRole,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Chat-app number when it differs from `phone`.
    #[serde(default)]
    pub chat_number: Option<String>,
    #[serde(default)]
    pub preferred_channels: Vec<DeliveryChannel>,
}

impl RecipientContact {
    pub fn new(user_id: impl Into<String>, role: RecipientRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            ..Default::default()
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_chat_number(mut self, number: impl Into<String>) -> Self {
        self.chat_number = Some(number.into());
        self
    }

    pub fn with_preferred_channels(mut self, channels: Vec<DeliveryChannel>) -> Self {
        self.preferred_channels = channels;
        self
    }

    /// Channel address for this contact, ignoring blank values.
    pub fn address_for(&self, channel: DeliveryChannel) -> Option<&str> {
        let candidate = match channel {
            DeliveryChannel::Chat | DeliveryChannel::ChatTemplated => non_blank(&self.chat_number)
                .or_else(|| non_blank(&self.phone)),
            DeliveryChannel::Email => non_blank(&self.email),
            DeliveryChannel::Sms => non_blank(&self.phone),
        };
        candidate.map(str::trim)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Source of recipient contact details, owned by the business domain.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn lookup(&self, recipient_id: &str) -> Result<Option<RecipientContact>>;
}

/// In-process directory for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryRecipientDirectory {
    contacts: DashMap<String, RecipientContact>,
}

impl InMemoryRecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: RecipientContact) {
        self.contacts.insert(contact.user_id.clone(), contact);
    }

    pub fn remove(&self, user_id: &str) -> Option<RecipientContact> {
        self.contacts.remove(user_id).map(|(_, contact)| contact)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryRecipientDirectory {
    async fn lookup(&self, recipient_id: &str) -> Result<Option<RecipientContact>> {
        Ok(self.contacts.get(recipient_id).map(|c| c.value().clone()))
    }
}

/// Channel routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Used when nothing more specific applies.
    #[serde(default = "default_channels")]
    pub default_channels: Vec<DeliveryChannel>,
    /// Fan-out for Critical events.
    #[serde(default = "default_critical_channels")]
    pub critical_channels: Vec<DeliveryChannel>,
    #[serde(default = "default_role_channels")]
    pub role_channels: HashMap<RecipientRole, Vec<DeliveryChannel>>,
}

fn default_channels() -> Vec<DeliveryChannel> {
    vec![DeliveryChannel::Chat]
}

fn default_critical_channels() -> Vec<DeliveryChannel> {
    vec![DeliveryChannel::Email, DeliveryChannel::Sms]
}

fn default_role_channels() -> HashMap<RecipientRole, Vec<DeliveryChannel>> {
    HashMap::from([
        (RecipientRole::Customer, vec![DeliveryChannel::Chat]),
        (RecipientRole::Merchant, vec![DeliveryChannel::Email]),
        (RecipientRole::Driver, vec![DeliveryChannel::Sms]),
        (RecipientRole::Staff, vec![DeliveryChannel::Email]),
    ])
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_channels: default_channels(),
            critical_channels: default_critical_channels(),
            role_channels: default_role_channels(),
        }
    }
}

/// Resolves which channels an event goes out on.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    config: RoutingConfig,
}

impl ChannelRouter {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    /// Channels for `event`, in delivery order and without duplicates.
    ///
    /// An explicit hint must parse and be served by a registered provider,
    /// otherwise `InvalidChannel`. Routed channels without a provider are
    /// skipped; if none remain the event is `InvalidChannel` as well.
    pub fn route(
        &self,
        event: &NotificationEvent,
        contact: Option<&RecipientContact>,
        registry: &ChannelRegistry,
    ) -> Result<Vec<DeliveryChannel>> {
        if let Some(hint) = event.channel_hint.as_deref() {
            let channel =
                DeliveryChannel::parse(hint).ok_or_else(|| Error::InvalidChannel(hint.to_string()))?;
            if !registry.supports(channel) {
                return Err(Error::InvalidChannel(channel.to_string()));
            }
            return Ok(vec![channel]);
        }

        let candidates = self.candidates(event, contact);
        let mut routed = Vec::with_capacity(candidates.len());
        for channel in candidates {
            if routed.contains(&channel) {
                continue;
            }
            if registry.supports(channel) {
                routed.push(channel);
            } else {
                warn!(
                    channel = %channel,
                    recipient_id = %event.recipient_id,
                    "No provider registered for routed channel, skipping"
                );
            }
        }

        if routed.is_empty() {
            return Err(Error::InvalidChannel(format!(
                "no supported channel for recipient {}",
                event.recipient_id
            )));
        }
        Ok(routed)
    }

    fn candidates(
        &self,
        event: &NotificationEvent,
        contact: Option<&RecipientContact>,
    ) -> Vec<DeliveryChannel> {
        if event.effective_priority() == NotificationPriority::Critical
            && !self.config.critical_channels.is_empty()
        {
            return self.config.critical_channels.clone();
        }

        if let Some(contact) = contact {
            if !contact.preferred_channels.is_empty() {
                return contact.preferred_channels.clone();
            }
            if let Some(channels) = self.config.role_channels.get(&contact.role)
                && !channels.is_empty()
            {
                return channels.clone();
            }
        }

        self.config.default_channels.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::channels::{
        ChannelProvider, OutboundMessage, ProviderError, ProviderReceipt,
    };
    use std::sync::Arc;

    struct NullProvider(&'static [DeliveryChannel]);

    #[async_trait]
    impl ChannelProvider for NullProvider {
        fn provider_name(&self) -> &'static str {
            "null"
        }

        fn channels(&self) -> &'static [DeliveryChannel] {
            self.0
        }

        async fn send(
            &self,
            _message: &OutboundMessage,
        ) -> std::result::Result<ProviderReceipt, ProviderError> {
            Err(ProviderError::permanent("unused"))
        }
    }

    fn registry(channels: &'static [DeliveryChannel]) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(NullProvider(channels)));
        registry
    }

    const ALL: &[DeliveryChannel] = &DeliveryChannel::ALL;

    #[test]
    fn test_hint_wins() {
        let router = ChannelRouter::default();
        let event = NotificationEvent::new("u-1", "merchant_alert").with_channel_hint("sms");
        assert_eq!(
            router.route(&event, None, &registry(ALL)).unwrap(),
            vec![DeliveryChannel::Sms]
        );
    }

    #[test]
    fn test_unknown_hint_is_invalid_channel() {
        let router = ChannelRouter::default();
        let event = NotificationEvent::new("u-1", "order_cancelled").with_channel_hint("pager");
        let err = router.route(&event, None, &registry(ALL)).unwrap_err();
        assert!(matches!(err, Error::InvalidChannel(ref c) if c == "pager"));
    }

    #[test]
    fn test_unregistered_hint_is_invalid_channel() {
        let router = ChannelRouter::default();
        let event = NotificationEvent::new("u-1", "order_cancelled").with_channel_hint("EMAIL");
        let err = router
            .route(&event, None, &registry(&[DeliveryChannel::Sms]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannel(_)));
    }

    #[test]
    fn test_critical_fans_out() {
        let router = ChannelRouter::default();
        let contact = RecipientContact::new("m-1", RecipientRole::Merchant)
            .with_preferred_channels(vec![DeliveryChannel::Chat]);
        let event = NotificationEvent::new("m-1", "merchant_alert");
        assert_eq!(
            router.route(&event, Some(&contact), &registry(ALL)).unwrap(),
            vec![DeliveryChannel::Email, DeliveryChannel::Sms]
        );
    }

    #[test]
    fn test_preferred_then_role_then_default() {
        let router = ChannelRouter::default();
        let event = NotificationEvent::new("u-1", "order_status_changed");

        let preferred = RecipientContact::new("u-1", RecipientRole::Customer)
            .with_preferred_channels(vec![DeliveryChannel::Sms, DeliveryChannel::Sms]);
        assert_eq!(
            router.route(&event, Some(&preferred), &registry(ALL)).unwrap(),
            vec![DeliveryChannel::Sms]
        );

        let driver = RecipientContact::new("d-1", RecipientRole::Driver);
        assert_eq!(
            router.route(&event, Some(&driver), &registry(ALL)).unwrap(),
            vec![DeliveryChannel::Sms]
        );

        assert_eq!(
            router.route(&event, None, &registry(ALL)).unwrap(),
            vec![DeliveryChannel::Chat]
        );
    }

    #[test]
    fn test_unsupported_routed_channels_are_skipped() {
        let router = ChannelRouter::default();
        let event = NotificationEvent::new("m-1", "merchant_alert");
        assert_eq!(
            router
                .route(&event, None, &registry(&[DeliveryChannel::Sms]))
                .unwrap(),
            vec![DeliveryChannel::Sms]
        );
        assert!(
            router
                .route(&event, None, &registry(&[DeliveryChannel::Chat]))
                .is_err()
        );
    }

    #[test]
    fn test_address_for_ignores_blank() {
        let contact = RecipientContact::new("u-1", RecipientRole::Customer)
            .with_phone("  ")
            .with_email("u@shop.test");
        assert_eq!(contact.address_for(DeliveryChannel::Sms), None);
        assert_eq!(contact.address_for(DeliveryChannel::Chat), None);
        assert_eq!(contact.address_for(DeliveryChannel::Email), Some("u@shop.test"));

        let chat = contact.with_chat_number("+15550001111");
        assert_eq!(chat.address_for(DeliveryChannel::ChatTemplated), Some("+15550001111"));
    }

    #[tokio::test]
    async fn test_in_memory_directory() {
        let directory = InMemoryRecipientDirectory::new();
        directory.upsert(RecipientContact::new("u-1", RecipientRole::Staff));
        assert!(directory.lookup("u-1").await.unwrap().is_some());
        assert!(directory.lookup("u-2").await.unwrap().is_none());
        assert_eq!(directory.len(), 1);
        assert!(directory.remove("u-1").is_some());
        assert!(directory.is_empty());
    }
}
