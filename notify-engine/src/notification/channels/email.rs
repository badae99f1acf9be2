//! Email channel over the Resend HTTP API (`POST /emails`).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ChannelProvider, MessageContent, OutboundMessage, ProviderError, ProviderReceipt,
    build_http_client, validate_api_base, validate_email,
};
use crate::Result;
use crate::database::models::DeliveryChannel;

/// Subject used when neither the template nor the event carries one.
const FALLBACK_SUBJECT: &str = "Notification";

/// Resend email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResendEmailConfig {
    pub api_key: String,
    /// Sender, e.g. `"Marketplace <no-reply@example.com>"`.
    pub from_address: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.resend.com".to_string()
}

impl Default for ResendEmailConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            from_address: String::new(),
            reply_to: None,
            api_base: default_api_base(),
        }
    }
}

/// Resend email provider.
pub struct ResendEmailChannel {
    config: ResendEmailConfig,
    client: Client,
}

impl ResendEmailChannel {
    pub fn new(config: ResendEmailConfig, timeout: Duration) -> Result<Self> {
        if config.api_key.trim().is_empty() || config.from_address.trim().is_empty() {
            return Err(crate::Error::config(
                "Email channel requires an API key and a sender address",
            ));
        }
        validate_api_base("Resend", &config.api_base)?;
        Ok(Self {
            client: build_http_client(timeout)?,
            config,
        })
    }

    fn build_payload(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        let to = validate_email(&message.recipient)?;
        let MessageContent::Text { body, subject } = &message.content else {
            return Err(ProviderError::permanent(
                "Email channel cannot send provider templates",
            ));
        };
        if body.trim().is_empty() {
            return Err(ProviderError::permanent("Empty email body"));
        }

        let mut payload = json!({
            "from": self.config.from_address,
            "to": [to],
            "subject": subject.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or(FALLBACK_SUBJECT),
            "text": body,
        });
        if let Some(reply_to) = &self.config.reply_to {
            payload["reply_to"] = json!(reply_to);
        }
        Ok(payload)
    }
}

#[async_trait]
impl ChannelProvider for ResendEmailChannel {
    fn provider_name(&self) -> &'static str {
        "resend"
    }

    fn channels(&self) -> &'static [DeliveryChannel] {
        &[DeliveryChannel::Email]
    }

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<ProviderReceipt, ProviderError> {
        let payload = self.build_payload(message)?;

        let response = self
            .client
            .post(format!("{}/emails", self.config.api_base.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            // Resend dedupes on this key, so a retried attempt is not sent twice.
            .header("Idempotency-Key", &message.attempt_id)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("Resend", &e))?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response("Resend", response).await);
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message_id = match body.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => {
                warn!(attempt_id = %message.attempt_id, "Resend accepted email without an id");
                format!("resend:{}", message.attempt_id)
            }
        };

        debug!(attempt_id = %message.attempt_id, message_id = %message_id, "Email accepted");
        Ok(ProviderReceipt {
            provider: self.provider_name(),
            message_id,
            metadata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ResendEmailChannel {
        ResendEmailChannel::new(
            ResendEmailConfig {
                api_key: "re_test".to_string(),
                from_address: "Shop <no-reply@shop.test>".to_string(),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn message(recipient: &str, content: MessageContent) -> OutboundMessage {
        OutboundMessage {
            attempt_id: "a-1".to_string(),
            channel: DeliveryChannel::Email,
            recipient: recipient.to_string(),
            content,
        }
    }

    #[test]
    fn test_payload() {
        let payload = channel()
            .build_payload(&message(
                "buyer@shop.test",
                MessageContent::Text {
                    body: "Payment received".to_string(),
                    subject: Some("Receipt".to_string()),
                },
            ))
            .unwrap();
        assert_eq!(payload["to"][0], "buyer@shop.test");
        assert_eq!(payload["subject"], "Receipt");
        assert_eq!(payload["text"], "Payment received");
        assert!(payload.get("reply_to").is_none());
    }

    #[test]
    fn test_missing_subject_falls_back() {
        let payload = channel()
            .build_payload(&message(
                "buyer@shop.test",
                MessageContent::Text {
                    body: "Hello".to_string(),
                    subject: None,
                },
            ))
            .unwrap();
        assert_eq!(payload["subject"], FALLBACK_SUBJECT);
    }

    #[test]
    fn test_invalid_address_is_permanent() {
        let err = channel()
            .build_payload(&message(
                "not-an-address",
                MessageContent::Text {
                    body: "Hello".to_string(),
                    subject: None,
                },
            ))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_template_content_rejected() {
        let err = channel()
            .build_payload(&message(
                "buyer@shop.test",
                MessageContent::Template {
                    name: "t".to_string(),
                    language: None,
                    parameters: vec![],
                },
            ))
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
