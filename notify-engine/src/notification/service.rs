//! Notification engine service.
//!
//! Composition root for intake, execution, the query surface and
//! administrative re-drive. Business workflows call [`NotificationEngine::submit`]
//! or [`NotificationEngine::dispatch`]; delivery failures are recorded on the
//! attempt rows and never returned to them.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, SchedulerConfig};
use crate::database::DbPool;
use crate::database::models::{
    AuditAction, DeliveryAttemptDbModel, DeliveryAttemptFilter, DeliveryAuditDbModel,
    DeliveryStatus, DeliveryStatusCounts, NotificationTemplateDbModel, Pagination,
};
use crate::database::repositories::{
    AuditRepository, ClaimScope, DeliveryAttemptRepository, NotificationRepository,
    SqlxAuditRepository, SqlxDeliveryAttemptRepository, SqlxNotificationRepository,
    SqlxTemplateRepository, TemplateRepository,
};
use crate::database::time::now_ms;
use crate::{Error, Result};

use super::channels::ChannelRegistry;
use super::dispatch::DeliveryDispatcher;
use super::events::{NotificationEvent, canonicalize_event_type};
use super::executor::{DeliveryExecutor, ExecuteOutcome};
use super::read_state::{BroadcastSessionPublisher, ReadStateFacade, RealtimeEvent};
use super::routing::{ChannelRouter, RecipientDirectory};
use super::scheduler::DeliveryScheduler;
use super::templates::TemplateResolver;

/// Actor recorded for intake rejections.
const INTAKE_ACTOR: &str = "intake";

/// Repositories the engine runs on.
#[derive(Clone)]
pub struct EngineRepositories {
    pub attempts: Arc<dyn DeliveryAttemptRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl EngineRepositories {
    /// SQLite-backed repositories sharing one pool.
    pub fn sqlx(pool: DbPool) -> Self {
        Self {
            attempts: Arc::new(SqlxDeliveryAttemptRepository::new(pool.clone())),
            notifications: Arc::new(SqlxNotificationRepository::new(pool.clone())),
            templates: Arc::new(SqlxTemplateRepository::new(pool.clone())),
            audit: Arc::new(SqlxAuditRepository::new(pool)),
        }
    }
}

/// A delivery attempt row created by intake.
struct IntakeRow {
    id: String,
    deliverable: bool,
}

/// The notification delivery engine.
pub struct NotificationEngine {
    repositories: EngineRepositories,
    directory: Arc<dyn RecipientDirectory>,
    registry: Arc<ChannelRegistry>,
    router: ChannelRouter,
    resolver: TemplateResolver,
    dispatcher: Arc<DeliveryDispatcher>,
    read_state: Arc<ReadStateFacade>,
    realtime: Arc<BroadcastSessionPublisher>,
    scheduler_config: SchedulerConfig,
}

impl NotificationEngine {
    pub fn new(
        repositories: EngineRepositories,
        registry: ChannelRegistry,
        directory: Arc<dyn RecipientDirectory>,
        config: &EngineConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let realtime = Arc::new(BroadcastSessionPublisher::new());
        let read_state = Arc::new(ReadStateFacade::new(
            Arc::clone(&repositories.notifications),
            realtime.clone(),
        ));
        let executor = Arc::new(DeliveryExecutor::new(
            Arc::clone(&repositories.attempts),
            Arc::clone(&registry),
            Arc::clone(&read_state),
            config.retry.clone(),
            config.scheduler.claim_timeout(),
        ));
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            executor,
            config.dispatch.max_concurrency,
        ));

        info!(
            channels = ?registry.channels(),
            max_retries = config.retry.max_retries,
            max_concurrency = dispatcher.max_concurrency(),
            "Notification engine initialized"
        );

        Self {
            resolver: TemplateResolver::new(Arc::clone(&repositories.templates)),
            router: ChannelRouter::new(config.routing.clone()),
            repositories,
            directory,
            registry,
            dispatcher,
            read_state,
            realtime,
            scheduler_config: config.scheduler.clone(),
        }
    }

    /// Engine over SQLite repositories.
    pub fn with_pool(
        pool: DbPool,
        registry: ChannelRegistry,
        directory: Arc<dyn RecipientDirectory>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(EngineRepositories::sqlx(pool), registry, directory, config)
    }

    /// Retry scheduler sharing this engine's dispatch pool.
    pub fn scheduler(&self, cancellation_token: CancellationToken) -> DeliveryScheduler {
        DeliveryScheduler::with_cancellation(
            Arc::clone(&self.repositories.attempts),
            Arc::clone(&self.dispatcher),
            self.scheduler_config.clone(),
            cancellation_token,
        )
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Accept an event, create one attempt per routed channel and run the
    /// first execution of each deliverable row.
    ///
    /// Returns the ids of every created row, including rows recorded as
    /// PERMANENTLY_FAILED at intake. Errors are intake errors only:
    /// `Validation` for an unknown event type, `InvalidChannel` when no
    /// supported channel applies, and storage failures.
    pub async fn submit(&self, event: NotificationEvent) -> Result<Vec<String>> {
        let rows = self.intake(event).await?;

        let deliverable = rows
            .iter()
            .filter(|row| row.deliverable)
            .map(|row| row.id.clone())
            .collect();
        let outcomes = self
            .dispatcher
            .run_batch(deliverable, ClaimScope::Any, Utc::now())
            .await;
        for (id, result) in outcomes {
            match result {
                Ok(outcome) => debug!(attempt_id = %id, ?outcome, "First attempt finished"),
                // The row stays claimable; the scheduler picks it up.
                Err(e) => warn!(attempt_id = %id, error = %e, "First attempt failed unexpectedly"),
            }
        }

        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// Fire-and-forget [`Self::submit`]. Returns `false` once the engine is
    /// shutting down.
    pub fn dispatch(self: &Arc<Self>, event: NotificationEvent) -> bool {
        let engine = Arc::clone(self);
        self.dispatcher.spawn_task(async move {
            let event_type = event.event_type.clone();
            let recipient_id = event.recipient_id.clone();
            if let Err(e) = engine.submit(event).await {
                warn!(
                    event_type = %event_type,
                    recipient_id = %recipient_id,
                    error = %e,
                    "Notification event rejected"
                );
            }
        })
    }

    async fn intake(&self, mut event: NotificationEvent) -> Result<Vec<IntakeRow>> {
        let Some(event_type) = canonicalize_event_type(&event.event_type) else {
            let e = Error::validation(format!(
                "Unknown notification event type '{}'",
                event.event_type
            ));
            self.audit_rejection(&event, &e).await;
            return Err(e);
        };
        event.event_type = event_type.to_string();
        event.recipient_id = event.recipient_id.trim().to_string();

        let contact = if event.recipient_id.is_empty() {
            None
        } else {
            self.directory.lookup(&event.recipient_id).await?
        };
        if contact.is_none() {
            warn!(recipient_id = %event.recipient_id, "Recipient not found in directory");
        }

        let channels = match self.router.route(&event, contact.as_ref(), &self.registry) {
            Ok(channels) => channels,
            Err(e @ Error::InvalidChannel(_)) => {
                self.audit_rejection(&event, &e).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let context_refs = serde_json::to_string(&event.context)?;
        let mut rows = Vec::with_capacity(channels.len());

        for channel in channels {
            let resolved = self.resolver.resolve(&event, channel).await?;
            let address = contact.as_ref().and_then(|c| c.address_for(channel));

            let mut row = DeliveryAttemptDbModel::new(
                channel,
                event.recipient_id.as_str(),
                address.unwrap_or_default(),
                event_type,
            );
            row.notification_ref = event.context.notification_id.clone();
            row.context_refs = context_refs.clone();
            row.rendered_parameters = if resolved.parameters.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&resolved.parameters)?)
            };
            let deliverable = resolved.is_deliverable();
            row.template_ref = resolved.template_ref;
            row.template_name = resolved.template_name;
            row.template_language = resolved.template_language;
            row.subject = resolved.subject;
            row.content = resolved.content;

            let rejection = if address.is_none() {
                Some(Error::missing_recipient(channel.as_str(), event.recipient_id.as_str()).to_string())
            } else if !deliverable {
                Some(format!(
                    "No template or content for {} on {}",
                    event_type, channel
                ))
            } else {
                None
            };

            if let Some(reason) = &rejection {
                warn!(
                    attempt_id = %row.id,
                    channel = %channel,
                    recipient_id = %event.recipient_id,
                    reason = %reason,
                    "Attempt recorded as permanently failed at intake"
                );
                row.status = DeliveryStatus::PermanentlyFailed.as_str().to_string();
                row.last_error = rejection.clone();
            }

            self.repositories.attempts.create_attempt(&row).await?;
            debug!(attempt_id = %row.id, channel = %channel, status = %row.status, "Delivery attempt created");

            rows.push(IntakeRow {
                id: row.id,
                deliverable: rejection.is_none(),
            });
        }

        Ok(rows)
    }

    async fn audit_rejection(&self, event: &NotificationEvent, error: &Error) {
        let detail = json!({
            "recipient_id": event.recipient_id,
            "event_type": event.event_type,
            "channel_hint": event.channel_hint,
            "reason": error.to_string(),
        });
        let entry = DeliveryAuditDbModel::new(
            None,
            AuditAction::IntakeRejected,
            INTAKE_ACTOR,
            detail.to_string(),
        );
        if let Err(e) = self.repositories.audit.add_entry(&entry).await {
            warn!(error = %e, "Failed to record intake rejection");
        }
    }

    // =========================================================================
    // Execution and read state
    // =========================================================================

    /// Execute one attempt now through the dispatch pool.
    pub async fn execute(&self, attempt_id: &str) -> Result<ExecuteOutcome> {
        self.dispatcher.run(attempt_id).await
    }

    /// Mark a user-facing notification as read.
    pub async fn acknowledge(&self, notification_id: &str) -> Result<()> {
        self.read_state.on_user_acknowledged(notification_id).await
    }

    /// Real-time delivery events for the session-room collaborator.
    pub fn subscribe_realtime(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.realtime.subscribe()
    }

    // =========================================================================
    // Query surface
    // =========================================================================

    pub async fn get_attempt(&self, attempt_id: &str) -> Result<DeliveryAttemptDbModel> {
        self.repositories.attempts.get_attempt(attempt_id).await
    }

    /// Filtered page of attempts, newest first, with the unpaginated total.
    pub async fn list_attempts(
        &self,
        filter: &DeliveryAttemptFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<DeliveryAttemptDbModel>, u64)> {
        self.repositories
            .attempts
            .list_attempts_filtered(filter, pagination)
            .await
    }

    pub async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
        self.repositories.attempts.status_counts().await
    }

    pub async fn audit_trail(&self, attempt_id: &str) -> Result<Vec<DeliveryAuditDbModel>> {
        self.repositories.audit.list_for_attempt(attempt_id).await
    }

    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<DeliveryAuditDbModel>> {
        self.repositories.audit.list_recent(limit).await
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Create or replace the template for its `(event_type, channel)` key.
    pub async fn upsert_template(&self, template: &NotificationTemplateDbModel) -> Result<()> {
        let Some(event_type) = canonicalize_event_type(&template.notification_type) else {
            return Err(Error::validation(format!(
                "Unknown notification event type '{}'",
                template.notification_type
            )));
        };
        let mut template = template.clone();
        template.notification_type = event_type.to_string();
        self.repositories.templates.upsert_template(&template).await
    }

    /// Move a PERMANENTLY_FAILED attempt back to PENDING, audit it, and run
    /// it once.
    pub async fn redrive(
        &self,
        attempt_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ExecuteOutcome> {
        let previous = self.repositories.attempts.get_attempt(attempt_id).await?;
        self.repositories
            .attempts
            .reset_for_redrive(attempt_id, now_ms())
            .await?;

        let detail = json!({
            "reason": reason,
            "previous_retry_count": previous.retry_count,
            "previous_error": previous.last_error,
        });
        let entry = DeliveryAuditDbModel::new(
            Some(attempt_id.to_string()),
            AuditAction::Redrive,
            actor,
            detail.to_string(),
        );
        self.repositories.audit.add_entry(&entry).await?;

        info!(attempt_id = %attempt_id, actor = %actor, "Delivery attempt re-driven");
        self.dispatcher.run(attempt_id).await
    }

    /// Stop accepting background work and wait for in-flight attempts.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!("Notification engine drained");
    }
}
