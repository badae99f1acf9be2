#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use notify_engine::config::EngineConfig;
use notify_engine::database::models::DeliveryChannel;
use notify_engine::database::{DbPool, init_pool, run_migrations};
use notify_engine::notification::{
    ChannelProvider, ChannelRegistry, InMemoryRecipientDirectory, NotificationEngine,
    OutboundMessage, ProviderError, ProviderReceipt, RecipientContact, RecipientRole,
};

/// Scripted provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Transient,
    Permanent,
}

/// In-process provider replaying a script, then a fallback step.
pub struct ScriptedProvider {
    channels: &'static [DeliveryChannel],
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    panic_for: Option<String>,
    calls: DashMap<String, u32>,
    total: AtomicU32,
    messages: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedProvider {
    pub fn new(channels: &'static [DeliveryChannel], fallback: Step) -> Self {
        Self {
            channels,
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            panic_for: None,
            calls: DashMap::new(),
            total: AtomicU32::new(0),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(channels: &'static [DeliveryChannel]) -> Self {
        Self::new(channels, Step::Succeed)
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Panic inside `send` for one recipient address.
    pub fn panicking_for(mut self, recipient: impl Into<String>) -> Self {
        self.panic_for = Some(recipient.into());
        self
    }

    pub fn calls_for(&self, attempt_id: &str) -> u32 {
        self.calls.get(attempt_id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl ChannelProvider for ScriptedProvider {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn channels(&self) -> &'static [DeliveryChannel] {
        self.channels
    }

    async fn send(&self, message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.entry(message.attempt_id.clone()).or_insert(0) += 1;
        self.messages.lock().push(message.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.panic_for.as_deref() == Some(message.recipient.as_str()) {
            panic!("adapter crashed for {}", message.recipient);
        }

        let step = self.script.lock().pop_front().unwrap_or(self.fallback);
        match step {
            Step::Succeed => Ok(ProviderReceipt {
                provider: "scripted",
                message_id: format!("msg-{}", message.attempt_id),
                metadata: None,
            }),
            Step::Transient => Err(ProviderError::transient("HTTP 503: upstream unavailable")),
            Step::Permanent => Err(ProviderError::permanent("HTTP 400: invalid recipient")),
        }
    }
}

pub const CHAT: &[DeliveryChannel] = &[DeliveryChannel::Chat, DeliveryChannel::ChatTemplated];
pub const EMAIL: &[DeliveryChannel] = &[DeliveryChannel::Email];
pub const SMS: &[DeliveryChannel] = &[DeliveryChannel::Sms];

pub async fn setup_db() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("engine.db").display());
    let pool = init_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub struct TestEngine {
    pub _dir: TempDir,
    pub pool: DbPool,
    pub engine: Arc<NotificationEngine>,
    pub directory: Arc<InMemoryRecipientDirectory>,
}

pub async fn engine_with(providers: Vec<Arc<ScriptedProvider>>, config: EngineConfig) -> TestEngine {
    let (dir, pool) = setup_db().await;
    let mut registry = ChannelRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    let directory = Arc::new(InMemoryRecipientDirectory::new());
    let engine = Arc::new(NotificationEngine::with_pool(
        pool.clone(),
        registry,
        directory.clone(),
        &config,
    ));
    TestEngine {
        _dir: dir,
        pool,
        engine,
        directory,
    }
}

pub async fn engine(providers: Vec<Arc<ScriptedProvider>>) -> TestEngine {
    engine_with(providers, EngineConfig::default()).await
}

pub fn customer(user_id: &str) -> RecipientContact {
    RecipientContact::new(user_id, RecipientRole::Customer)
        .with_chat_number("+15550001111")
        .with_phone("+15550002222")
        .with_email("customer@example.com")
}
