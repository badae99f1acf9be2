//! WhatsApp Cloud API channel.
//!
//! Sends free-form text (CHAT) and pre-approved template messages
//! (CHAT_TEMPLATED) via `POST /{version}/{phone_number_id}/messages`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ChannelProvider, MessageContent, OutboundMessage, ProviderError, ProviderReceipt,
    build_http_client, normalize_phone, truncate_string, validate_api_base,
};
use crate::Result;
use crate::database::models::DeliveryChannel;

/// WhatsApp text message body limit.
const WHATSAPP_TEXT_LIMIT: usize = 4096;

/// WhatsApp channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    /// Graph API access token.
    pub access_token: String,
    /// Sender phone number id.
    pub phone_number_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Language used for templates that do not carry one.
    #[serde(default = "default_template_language")]
    pub default_language: String,
}

fn default_api_base() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v19.0".to_string()
}

fn default_template_language() -> String {
    "en_US".to_string()
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            phone_number_id: String::new(),
            api_base: default_api_base(),
            api_version: default_api_version(),
            default_language: default_template_language(),
        }
    }
}

/// WhatsApp Cloud API provider.
pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    client: Client,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig, timeout: Duration) -> Result<Self> {
        if config.access_token.trim().is_empty() || config.phone_number_id.trim().is_empty() {
            return Err(crate::Error::config(
                "WhatsApp channel requires an access token and phone number id",
            ));
        }
        validate_api_base("WhatsApp", &config.api_base)?;
        Ok(Self {
            client: build_http_client(timeout)?,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            self.config.api_version,
            self.config.phone_number_id
        )
    }

    /// Build the JSON payload for a message.
    fn build_payload(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        // The API expects the number without the leading '+'.
        let to = normalize_phone(&message.recipient)?
            .trim_start_matches('+')
            .to_string();

        match (&message.content, message.channel) {
            // Templated rows without a template fall back to a session text message.
            (MessageContent::Text { body, .. }, _) => {
                if body.trim().is_empty() {
                    return Err(ProviderError::permanent("Empty WhatsApp message body"));
                }
                Ok(json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": to,
                    "type": "text",
                    "text": {
                        "preview_url": false,
                        "body": truncate_string(body, WHATSAPP_TEXT_LIMIT),
                    },
                }))
            }
            (
                MessageContent::Template {
                    name,
                    language,
                    parameters,
                },
                DeliveryChannel::ChatTemplated,
            ) => {
                if name.trim().is_empty() {
                    return Err(ProviderError::permanent("Empty WhatsApp template name"));
                }
                let mut template = json!({
                    "name": name,
                    "language": {
                        "code": language.as_deref().unwrap_or(&self.config.default_language),
                    },
                });
                if !parameters.is_empty() {
                    let params: Vec<_> = parameters
                        .iter()
                        .map(|p| json!({ "type": "text", "text": p }))
                        .collect();
                    template["components"] = json!([{ "type": "body", "parameters": params }]);
                }
                Ok(json!({
                    "messaging_product": "whatsapp",
                    "to": to,
                    "type": "template",
                    "template": template,
                }))
            }
            (MessageContent::Template { .. }, channel) => Err(ProviderError::permanent(format!(
                "Template messages are not supported on channel {}",
                channel
            ))),
        }
    }
}

/// Message id from a Cloud API send response.
fn parse_message_id(body: &serde_json::Value) -> Option<String> {
    body.get("messages")?
        .get(0)?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl ChannelProvider for WhatsAppChannel {
    fn provider_name(&self) -> &'static str {
        "whatsapp"
    }

    fn channels(&self) -> &'static [DeliveryChannel] {
        &[DeliveryChannel::Chat, DeliveryChannel::ChatTemplated]
    }

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<ProviderReceipt, ProviderError> {
        let payload = self.build_payload(message)?;

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("WhatsApp", &e))?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response("WhatsApp", response).await);
        }

        // A 2xx means the message was accepted; never retry it over a bad body.
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message_id = parse_message_id(&body).unwrap_or_else(|| {
            warn!(attempt_id = %message.attempt_id, "WhatsApp accepted message without an id");
            format!("whatsapp:{}", message.attempt_id)
        });

        debug!(attempt_id = %message.attempt_id, message_id = %message_id, "WhatsApp message accepted");
        Ok(ProviderReceipt {
            provider: self.provider_name(),
            message_id,
            metadata: body.get("contacts").cloned().map(|c| json!({ "contacts": c })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> WhatsAppChannel {
        WhatsAppChannel::new(
            WhatsAppConfig {
                access_token: "token".to_string(),
                phone_number_id: "10001".to_string(),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn message(channel: DeliveryChannel, content: MessageContent) -> OutboundMessage {
        OutboundMessage {
            attempt_id: "a-1".to_string(),
            channel,
            recipient: "+1 555 010 9999".to_string(),
            content,
        }
    }

    #[test]
    fn test_requires_credentials() {
        assert!(WhatsAppChannel::new(WhatsAppConfig::default(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            channel().endpoint(),
            "https://graph.facebook.com/v19.0/10001/messages"
        );
    }

    #[test]
    fn test_text_payload() {
        let payload = channel()
            .build_payload(&message(
                DeliveryChannel::Chat,
                MessageContent::Text {
                    body: "Your order shipped".to_string(),
                    subject: None,
                },
            ))
            .unwrap();
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["to"], "15550109999");
        assert_eq!(payload["text"]["body"], "Your order shipped");
    }

    #[test]
    fn test_template_payload() {
        let payload = channel()
            .build_payload(&message(
                DeliveryChannel::ChatTemplated,
                MessageContent::Template {
                    name: "order_update".to_string(),
                    language: None,
                    parameters: vec!["A-100".to_string(), "shipped".to_string()],
                },
            ))
            .unwrap();
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["language"]["code"], "en_US");
        let params = &payload["template"]["components"][0]["parameters"];
        assert_eq!(params[0]["text"], "A-100");
        assert_eq!(params[1]["text"], "shipped");
    }

    #[test]
    fn test_template_on_plain_chat_is_permanent() {
        let err = channel()
            .build_payload(&message(
                DeliveryChannel::Chat,
                MessageContent::Template {
                    name: "order_update".to_string(),
                    language: None,
                    parameters: vec![],
                },
            ))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_templated_channel_accepts_text_fallback() {
        let payload = channel()
            .build_payload(&message(
                DeliveryChannel::ChatTemplated,
                MessageContent::Text {
                    body: "hi".to_string(),
                    subject: None,
                },
            ))
            .unwrap();
        assert_eq!(payload["type"], "text");
    }

    #[test]
    fn test_parse_message_id() {
        let body = json!({ "messages": [{ "id": "wamid.ABC" }] });
        assert_eq!(parse_message_id(&body).as_deref(), Some("wamid.ABC"));
        assert_eq!(parse_message_id(&json!({})), None);
    }
}
