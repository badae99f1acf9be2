//! Notification delivery engine.
//!
//! Business events enter through [`NotificationEngine::submit`], are routed
//! to one or more channels, resolved against templates and persisted as
//! delivery attempts. The executor hands each attempt to its channel
//! provider; transient failures are retried with exponential backoff by the
//! scheduler until the attempt is SENT or PERMANENTLY_FAILED.

pub mod channels;
pub mod dispatch;
pub mod events;
pub mod executor;
pub mod read_state;
pub mod routing;
pub mod scheduler;
pub mod service;
pub mod templates;

pub use channels::{
    ChannelProvider, ChannelRegistry, ChannelsConfig, MessageContent, OutboundMessage,
    ProviderError, ProviderErrorKind, ProviderReceipt,
};
pub use dispatch::DeliveryDispatcher;
pub use events::{ContextRefs, NotificationEvent, NotificationPriority};
pub use executor::{DeliveryExecutor, ExecuteOutcome, SkipReason};
pub use read_state::{
    BroadcastSessionPublisher, ReadStateFacade, RealtimeEvent, SessionPublisher,
};
pub use routing::{
    ChannelRouter, InMemoryRecipientDirectory, RecipientContact, RecipientDirectory,
    RecipientRole, RoutingConfig,
};
pub use scheduler::{DeliveryScheduler, SweepReport};
pub use service::{EngineRepositories, NotificationEngine};
pub use templates::{ResolvedContent, TemplateResolver};
