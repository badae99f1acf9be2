//! Template resolution and `{placeholder}` rendering.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;
use crate::database::models::{DeliveryChannel, NotificationTemplateDbModel};
use crate::database::repositories::TemplateRepository;

use super::events::{NotificationEvent, event_type_info};

/// Content resolved for one (event, channel) pair, ready to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedContent {
    /// Provider template id (CHAT_TEMPLATED) or the local template id.
    pub template_ref: Option<String>,
    pub template_name: Option<String>,
    pub template_language: Option<String>,
    /// Template parameters in placeholder order.
    pub parameters: Vec<String>,
    pub subject: Option<String>,
    /// Final rendered body; `None` for provider template messages.
    pub content: Option<String>,
}

impl ResolvedContent {
    /// Whether anything can be handed to a provider.
    pub fn is_deliverable(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
            || (self.content.is_none() && self.template_ref.is_some())
    }
}

/// Replace `{key}` markers with values; unknown markers stay verbatim.
pub fn render(body: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_key(&after[..close]) => {
                let key = &after[..close];
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Placeholder keys in order of first appearance.
pub fn placeholders(body: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let mut rest = body;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_key(&after[..close]) => {
                let key = &after[..close];
                if !keys.iter().any(|k| k == key) {
                    keys.push(key.to_string());
                }
                rest = &after[close + 1..];
            }
            _ => rest = after,
        }
    }
    keys
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Resolves templates by `(event_type, channel)`, falling back to the
/// caller-rendered content.
pub struct TemplateResolver {
    templates: Arc<dyn TemplateRepository>,
}

impl TemplateResolver {
    pub fn new(templates: Arc<dyn TemplateRepository>) -> Self {
        Self { templates }
    }

    /// `event.event_type` must already be canonical.
    pub async fn resolve(
        &self,
        event: &NotificationEvent,
        channel: DeliveryChannel,
    ) -> Result<ResolvedContent> {
        let template = self
            .templates
            .find_template(&event.event_type, channel)
            .await?;

        Ok(match template {
            Some(template) => from_template(&template, event, channel),
            None => fallback(event, channel),
        })
    }
}

fn from_template(
    template: &NotificationTemplateDbModel,
    event: &NotificationEvent,
    channel: DeliveryChannel,
) -> ResolvedContent {
    let values = event.template_values();
    let parameters = placeholders(&template.body)
        .iter()
        .map(|key| values.get(key).cloned().unwrap_or_default())
        .collect();

    if channel == DeliveryChannel::ChatTemplated {
        return ResolvedContent {
            template_ref: Some(
                template
                    .provider_template_ref
                    .clone()
                    .unwrap_or_else(|| template.name.clone()),
            ),
            template_name: Some(template.name.clone()),
            template_language: template.language.clone(),
            parameters,
            subject: None,
            content: None,
        };
    }

    let subject = if channel == DeliveryChannel::Email {
        template
            .subject
            .as_deref()
            .map(|s| render(s, &values))
            .or_else(|| event.subject.clone())
            .or_else(|| default_subject(event))
    } else {
        None
    };

    ResolvedContent {
        template_ref: Some(template.id.clone()),
        template_name: Some(template.name.clone()),
        template_language: None,
        parameters,
        subject,
        content: Some(render(&template.body, &values)),
    }
}

fn fallback(event: &NotificationEvent, channel: DeliveryChannel) -> ResolvedContent {
    let subject = if channel == DeliveryChannel::Email {
        event.subject.clone().or_else(|| default_subject(event))
    } else {
        None
    };
    ResolvedContent {
        subject,
        content: event.rendered_content.clone(),
        ..Default::default()
    }
}

fn default_subject(event: &NotificationEvent) -> Option<String> {
    event_type_info(&event.event_type).map(|info| info.label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_replaces_known_keys() {
        let out = render(
            "Order {order_id} is {status}.",
            &values(&[("order_id", "A-1"), ("status", "shipped")]),
        );
        assert_eq!(out, "Order A-1 is shipped.");
    }

    #[test]
    fn test_render_keeps_unknown_and_malformed_markers() {
        let out = render(
            "Hi {name}, {missing} { spaced } {unclosed",
            &values(&[("name", "Ana")]),
        );
        assert_eq!(out, "Hi Ana, {missing} { spaced } {unclosed");
    }

    #[test]
    fn test_render_handles_multibyte_text() {
        let out = render("¡Hola {name}! ✓", &values(&[("name", "José")]));
        assert_eq!(out, "¡Hola José! ✓");
    }

    #[test]
    fn test_placeholders_in_first_appearance_order() {
        assert_eq!(
            placeholders("{b} then {a}, again {b} and {not valid}"),
            vec!["b".to_string(), "a".to_string()]
        );
        assert!(placeholders("no markers").is_empty());
    }

    #[test]
    fn test_templated_chat_keeps_content_null() {
        let template = NotificationTemplateDbModel::new(
            "order_update",
            "order_status_changed",
            DeliveryChannel::ChatTemplated,
            "Order {order_id} is {status}",
        )
        .with_provider_template("order_update_v2", "es");
        let event = NotificationEvent::new("u-1", "order_status_changed")
            .with_order("A-7")
            .with_param("status", "ready");

        let resolved = from_template(&template, &event, DeliveryChannel::ChatTemplated);
        assert_eq!(resolved.content, None);
        assert_eq!(resolved.template_ref.as_deref(), Some("order_update_v2"));
        assert_eq!(resolved.template_language.as_deref(), Some("es"));
        assert_eq!(resolved.parameters, vec!["A-7", "ready"]);
        assert!(resolved.is_deliverable());
    }

    #[test]
    fn test_email_subject_from_template() {
        let template = NotificationTemplateDbModel::new(
            "payment_email",
            "payment_failed",
            DeliveryChannel::Email,
            "Payment {payment_id} failed",
        )
        .with_subject("Action needed: {payment_id}");
        let event = NotificationEvent::new("u-1", "payment_failed").with_payment("P-3");

        let resolved = from_template(&template, &event, DeliveryChannel::Email);
        assert_eq!(resolved.subject.as_deref(), Some("Action needed: P-3"));
        assert_eq!(resolved.content.as_deref(), Some("Payment P-3 failed"));
    }

    #[test]
    fn test_fallback_uses_caller_content() {
        let event =
            NotificationEvent::new("u-1", "booking_created").with_content("Booking confirmed");
        let resolved = fallback(&event, DeliveryChannel::Email);
        assert_eq!(resolved.content.as_deref(), Some("Booking confirmed"));
        assert_eq!(resolved.subject.as_deref(), Some("Booking Created"));
        assert!(resolved.template_ref.is_none());

        let empty = fallback(&NotificationEvent::new("u-1", "booking_created"), DeliveryChannel::Sms);
        assert!(!empty.is_deliverable());
    }
}
