//! SMS channel over the Twilio Messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ChannelProvider, MessageContent, OutboundMessage, ProviderError, ProviderReceipt,
    build_http_client, normalize_phone, truncate_string, validate_api_base,
};
use crate::Result;
use crate::database::models::DeliveryChannel;

/// Twilio concatenated-SMS body limit.
const SMS_BODY_LIMIT: usize = 1600;

/// Twilio SMS channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioSmsConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Sender number in E.164 form, or a messaging service sid (`MG...`).
    pub from: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.twilio.com".to_string()
}

impl Default for TwilioSmsConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from: String::new(),
            api_base: default_api_base(),
        }
    }
}

/// Twilio SMS provider.
pub struct TwilioSmsChannel {
    config: TwilioSmsConfig,
    client: Client,
}

impl TwilioSmsChannel {
    pub fn new(config: TwilioSmsConfig, timeout: Duration) -> Result<Self> {
        if config.account_sid.trim().is_empty()
            || config.auth_token.trim().is_empty()
            || config.from.trim().is_empty()
        {
            return Err(crate::Error::config(
                "SMS channel requires an account sid, auth token and sender",
            ));
        }
        validate_api_base("Twilio", &config.api_base)?;
        Ok(Self {
            client: build_http_client(timeout)?,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    /// Form fields for the Messages resource.
    fn build_form(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<Vec<(&'static str, String)>, ProviderError> {
        let to = normalize_phone(&message.recipient)?;
        let MessageContent::Text { body, .. } = &message.content else {
            return Err(ProviderError::permanent(
                "SMS channel cannot send provider templates",
            ));
        };
        if body.trim().is_empty() {
            return Err(ProviderError::permanent("Empty SMS body"));
        }

        let sender_field = if self.config.from.starts_with("MG") {
            "MessagingServiceSid"
        } else {
            "From"
        };

        Ok(vec![
            ("To", to),
            (sender_field, self.config.from.clone()),
            ("Body", truncate_string(body, SMS_BODY_LIMIT)),
        ])
    }
}

#[async_trait]
impl ChannelProvider for TwilioSmsChannel {
    fn provider_name(&self) -> &'static str {
        "twilio"
    }

    fn channels(&self) -> &'static [DeliveryChannel] {
        &[DeliveryChannel::Sms]
    }

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<ProviderReceipt, ProviderError> {
        let form = self.build_form(message)?;

        let response = self
            .client
            .post(self.endpoint())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("Twilio", &e))?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response("Twilio", response).await);
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message_id = match body.get("sid").and_then(|v| v.as_str()) {
            Some(sid) => sid.to_string(),
            None => {
                warn!(attempt_id = %message.attempt_id, "Twilio accepted SMS without a sid");
                format!("twilio:{}", message.attempt_id)
            }
        };
        let metadata = body
            .get("status")
            .cloned()
            .map(|status| serde_json::json!({ "twilio_status": status }));

        debug!(attempt_id = %message.attempt_id, message_id = %message_id, "SMS accepted");
        Ok(ProviderReceipt {
            provider: self.provider_name(),
            message_id,
            metadata,
        })
    }
}
