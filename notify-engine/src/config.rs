//! Engine configuration.
//!
//! Loaded from environment variables (with `.env` support through dotenvy);
//! everything has a default so an empty environment yields a working,
//! provider-less engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::database::models::DeliveryChannel;
use crate::domain::RetryPolicy;
use crate::notification::channels::{
    ChannelsConfig, ResendEmailConfig, TwilioSmsConfig, WhatsAppConfig,
};
use crate::notification::routing::RoutingConfig;
use crate::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:notify-engine.db?mode=rwc";

/// Retry sweep settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Claims older than this are treated as abandoned.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    /// Maximum rows picked up by one sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Terminal rows older than this many days are pruned. `None` keeps
    /// everything.
    #[serde(default)]
    pub retention_days: Option<u32>,
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_claim_timeout_secs() -> u64 {
    120
}

fn default_batch_size() -> u32 {
    100
}

impl SchedulerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_days
            .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            batch_size: default_batch_size(),
            retention_days: None,
        }
    }
}

/// Bounds on concurrent provider calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    10
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Directory for rolling log files; console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: None,
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            routing: RoutingConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = get("NOTIFY_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }

        if let Some(v) = parse_var(&get, "NOTIFY_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var(&get, "NOTIFY_RETRY_BASE_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&get, "NOTIFY_RETRY_MAX_MS")? {
            config.retry.max_delay_ms = v;
        }

        if let Some(v) = parse_var(&get, "NOTIFY_SWEEP_INTERVAL_SECS")? {
            config.scheduler.sweep_interval_secs = v;
        }
        if let Some(v) = parse_var(&get, "NOTIFY_CLAIM_TIMEOUT_SECS")? {
            config.scheduler.claim_timeout_secs = v;
        }
        if let Some(v) = parse_var(&get, "NOTIFY_SWEEP_BATCH_SIZE")? {
            config.scheduler.batch_size = v;
        }
        if let Some(v) = parse_var(&get, "NOTIFY_RETENTION_DAYS")? {
            config.scheduler.retention_days = Some(v);
        }

        if let Some(v) = parse_var(&get, "NOTIFY_MAX_CONCURRENCY")? {
            config.dispatch.max_concurrency = v;
        }

        if let Some(channels) = parse_channels(&get, "NOTIFY_DEFAULT_CHANNELS")? {
            config.routing.default_channels = channels;
        }
        if let Some(channels) = parse_channels(&get, "NOTIFY_CRITICAL_CHANNELS")? {
            config.routing.critical_channels = channels;
        }

        if let Some(v) = parse_var(&get, "NOTIFY_PROVIDER_TIMEOUT_SECS")? {
            config.channels.timeout_secs = v;
        }

        if let (Some(access_token), Some(phone_number_id)) = (
            get("NOTIFY_WHATSAPP_ACCESS_TOKEN"),
            get("NOTIFY_WHATSAPP_PHONE_NUMBER_ID"),
        ) {
            let mut whatsapp = WhatsAppConfig {
                access_token,
                phone_number_id,
                ..Default::default()
            };
            if let Some(base) = get("NOTIFY_WHATSAPP_API_BASE") {
                whatsapp.api_base = base;
            }
            if let Some(language) = get("NOTIFY_WHATSAPP_DEFAULT_LANGUAGE") {
                whatsapp.default_language = language;
            }
            config.channels.whatsapp = Some(whatsapp);
        }

        if let (Some(api_key), Some(from_address)) =
            (get("NOTIFY_EMAIL_API_KEY"), get("NOTIFY_EMAIL_FROM"))
        {
            let mut email = ResendEmailConfig {
                api_key,
                from_address,
                reply_to: get("NOTIFY_EMAIL_REPLY_TO"),
                ..Default::default()
            };
            if let Some(base) = get("NOTIFY_EMAIL_API_BASE") {
                email.api_base = base;
            }
            config.channels.email = Some(email);
        }

        if let (Some(account_sid), Some(auth_token), Some(from)) = (
            get("NOTIFY_SMS_ACCOUNT_SID"),
            get("NOTIFY_SMS_AUTH_TOKEN"),
            get("NOTIFY_SMS_FROM"),
        ) {
            let mut sms = TwilioSmsConfig {
                account_sid,
                auth_token,
                from,
                ..Default::default()
            };
            if let Some(base) = get("NOTIFY_SMS_API_BASE") {
                sms.api_base = base;
            }
            config.channels.sms = Some(sms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the engine.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(Error::config("DATABASE_URL must not be empty"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(Error::config("NOTIFY_RETRY_BASE_MS must be positive"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::config(
                "NOTIFY_RETRY_MAX_MS must be at least NOTIFY_RETRY_BASE_MS",
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(Error::config("NOTIFY_SWEEP_BATCH_SIZE must be positive"));
        }
        if self.dispatch.max_concurrency == 0 {
            return Err(Error::config("NOTIFY_MAX_CONCURRENCY must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("Invalid {}='{}': {}", key, raw, e))),
        None => Ok(None),
    }
}

fn parse_channels<G>(get: &G, key: &str) -> Result<Option<Vec<DeliveryChannel>>>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(None);
    };

    let mut channels = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let channel = DeliveryChannel::parse(part)
            .ok_or_else(|| Error::config(format!("Invalid {}: unknown channel '{}'", key, part)))?;
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    Ok(Some(channels))
}
