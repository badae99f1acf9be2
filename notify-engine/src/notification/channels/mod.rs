//! Channel provider adapters.
//!
//! Each adapter wraps one external transport behind [`ChannelProvider`]:
//! - WhatsApp Cloud API (CHAT and CHAT_TEMPLATED)
//! - Resend (EMAIL)
//! - Twilio (SMS)
//!
//! Adapters classify their own failures as transient or permanent; the
//! executor trusts that classification when deciding whether to retry.

mod email;
mod sms;
mod whatsapp;

pub use email::{ResendEmailChannel, ResendEmailConfig};
pub use sms::{TwilioSmsChannel, TwilioSmsConfig};
pub use whatsapp::{WhatsAppChannel, WhatsAppConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::Result;
use crate::database::models::DeliveryChannel;

/// Maximum characters of a provider response body kept in error details.
const ERROR_BODY_LIMIT: usize = 512;

/// Body or template reference handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    Template {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        parameters: Vec<String>,
    },
}

/// One message for one recipient on one channel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub attempt_id: String,
    pub channel: DeliveryChannel,
    /// Channel address: phone number or email address.
    pub recipient: String,
    pub content: MessageContent,
}

/// Successful hand-off to a provider.
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    pub provider: &'static str,
    pub message_id: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProviderErrorKind {
    /// May succeed on retry (timeout, rate limit, server error).
    Transient,
    /// Will not succeed on retry (bad address, rejected content, auth).
    Permanent,
}

/// Failure reported by a provider adapter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} provider error: {detail}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub detail: String,
    /// Provider diagnostics (HTTP status, Retry-After, response excerpt).
    pub metadata: Option<serde_json::Value>,
}

impl ProviderError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            detail: detail.into(),
            metadata: None,
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            detail: detail.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    /// Classify a transport-level failure (no HTTP response received).
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::permanent(format!("{} request could not be built: {}", provider, err));
        }
        // Timeouts, refused connections and dropped bodies are worth retrying.
        Self::transient(format!("{} request failed: {}", provider, err))
    }

    /// Classify a non-success HTTP response.
    pub async fn from_response(provider: &str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = retry_after_secs(&response);
        let body = response.text().await.unwrap_or_default();
        let detail = format!(
            "{} returned HTTP {}: {}",
            provider,
            status,
            truncate_string(body.trim(), ERROR_BODY_LIMIT)
        );

        let mut metadata = serde_json::json!({ "http_status": status });
        if let Some(secs) = retry_after {
            metadata["retry_after_secs"] = serde_json::json!(secs);
        }

        let error = match classify_status(status) {
            ProviderErrorKind::Transient => Self::transient(detail),
            ProviderErrorKind::Permanent => Self::permanent(detail),
        };
        error.with_metadata(metadata)
    }
}

/// Retry eligibility of an HTTP status code.
pub fn classify_status(status: u16) -> ProviderErrorKind {
    match status {
        408 | 425 | 429 => ProviderErrorKind::Transient,
        500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Permanent,
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

pub(crate) fn truncate_string(input: &str, max_chars: usize) -> String {
    let mut chars = input.chars();
    let mut out: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        out.push('…');
    }
    out
}

/// Normalize a phone number to `+<digits>`, rejecting anything that is not
/// plausibly E.164.
pub(crate) fn normalize_phone(raw: &str) -> std::result::Result<String, ProviderError> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);
    if !(8..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ProviderError::permanent(format!(
            "Invalid phone number: '{}'",
            raw
        )));
    }
    Ok(format!("+{}", digits))
}

/// Minimal shape check for an email address.
pub(crate) fn validate_email(raw: &str) -> std::result::Result<&str, ProviderError> {
    let trimmed = raw.trim();
    let valid = trimmed
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        })
        && !trimmed.contains(char::is_whitespace);
    if valid {
        Ok(trimmed)
    } else {
        Err(ProviderError::permanent(format!(
            "Invalid email address: '{}'",
            raw
        )))
    }
}

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Reject provider base URLs that are not absolute http(s) URLs.
pub(crate) fn validate_api_base(provider: &str, api_base: &str) -> Result<()> {
    let parsed = url::Url::parse(api_base).map_err(|e| {
        crate::Error::config(format!("Invalid {} API base '{}': {}", provider, api_base, e))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(crate::Error::config(format!(
            "Invalid {} API base '{}': unsupported scheme",
            provider, api_base
        )));
    }
    Ok(())
}

/// Shared HTTP client for provider adapters.
pub(crate) fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("notify-engine/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| crate::Error::config(format!("Failed to build HTTP client: {}", e)))
}

/// Uniform send capability over one external transport.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Stable provider name recorded in `delivery_provider`.
    fn provider_name(&self) -> &'static str;

    /// Channels this provider can deliver.
    fn channels(&self) -> &'static [DeliveryChannel];

    async fn send(
        &self,
        message: &OutboundMessage,
    ) -> std::result::Result<ProviderReceipt, ProviderError>;
}

/// Provider credentials for every channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: Option<WhatsAppConfig>,
    #[serde(default)]
    pub email: Option<ResendEmailConfig>,
    #[serde(default)]
    pub sms: Option<TwilioSmsConfig>,
    /// Per-request timeout for provider calls.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    15
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            whatsapp: None,
            email: None,
            sms: None,
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

/// Maps each channel to the provider that delivers it.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    providers: HashMap<DeliveryChannel, Arc<dyn ChannelProvider>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configured credentials. Channels without
    /// credentials stay unregistered and are rejected at intake.
    pub fn from_config(config: &ChannelsConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let mut registry = Self::new();

        if let Some(whatsapp) = &config.whatsapp {
            registry.register(Arc::new(WhatsAppChannel::new(whatsapp.clone(), timeout)?));
        }
        if let Some(email) = &config.email {
            registry.register(Arc::new(ResendEmailChannel::new(email.clone(), timeout)?));
        }
        if let Some(sms) = &config.sms {
            registry.register(Arc::new(TwilioSmsChannel::new(sms.clone(), timeout)?));
        }

        Ok(registry)
    }

    /// Register `provider` for every channel it declares, replacing any
    /// previous registration.
    pub fn register(&mut self, provider: Arc<dyn ChannelProvider>) -> &mut Self {
        for channel in provider.channels() {
            self.providers.insert(*channel, Arc::clone(&provider));
        }
        self
    }

    /// Register `provider` for a single channel.
    pub fn register_for(
        &mut self,
        channel: DeliveryChannel,
        provider: Arc<dyn ChannelProvider>,
    ) -> &mut Self {
        self.providers.insert(channel, provider);
        self
    }

    pub fn get(&self, channel: DeliveryChannel) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.get(&channel).cloned()
    }

    pub fn supports(&self, channel: DeliveryChannel) -> bool {
        self.providers.contains_key(&channel)
    }

    /// Registered channels in a stable order.
    pub fn channels(&self) -> Vec<DeliveryChannel> {
        let mut channels: Vec<_> = self.providers.keys().copied().collect();
        channels.sort();
        channels
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<_> = self
            .channels()
            .into_iter()
            .filter_map(|c| self.providers.get(&c).map(|p| (c, p.provider_name())))
            .collect();
        f.debug_struct("ChannelRegistry")
            .field("providers", &entries)
            .finish()
    }
}
