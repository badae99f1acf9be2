//! Delivery attempt executor.
//!
//! Claims one attempt row, hands it to the channel provider, classifies the
//! outcome and writes it back under the claim.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::models::{DeliveryAttemptDbModel, DeliveryChannel, DeliveryStatus};
use crate::database::repositories::{
    AttemptResolution, ClaimRequest, ClaimScope, DeliveryAttemptRepository,
};
use crate::database::time::{datetime_to_ms, ms_before};
use crate::domain::RetryPolicy;
use crate::{Error, Result};

use super::channels::{ChannelRegistry, MessageContent, OutboundMessage, ProviderError};
use super::read_state::ReadStateFacade;

/// Why an execution did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Row is SENT or PERMANENTLY_FAILED.
    AlreadyTerminal,
    /// Another executor holds the row, or the row is not due.
    ClaimHeld,
}

/// Persisted result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Delivered {
        provider_message_id: String,
    },
    RetryScheduled {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    PermanentlyFailed {
        reason: String,
    },
    Skipped(SkipReason),
}

impl ExecuteOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Executes delivery attempts against channel providers.
pub struct DeliveryExecutor {
    attempts: Arc<dyn DeliveryAttemptRepository>,
    registry: Arc<ChannelRegistry>,
    read_state: Arc<ReadStateFacade>,
    retry_policy: RetryPolicy,
    claim_timeout: Duration,
}

impl DeliveryExecutor {
    pub fn new(
        attempts: Arc<dyn DeliveryAttemptRepository>,
        registry: Arc<ChannelRegistry>,
        read_state: Arc<ReadStateFacade>,
        retry_policy: RetryPolicy,
        claim_timeout: Duration,
    ) -> Self {
        Self {
            attempts,
            registry,
            read_state,
            retry_policy,
            claim_timeout,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Execute an attempt now, whatever its retry schedule.
    ///
    /// Terminal rows and rows held by another executor are no-ops.
    pub async fn execute(&self, attempt_id: &str) -> Result<ExecuteOutcome> {
        self.execute_at(attempt_id, ClaimScope::Any, Utc::now()).await
    }

    /// Execute an attempt with an explicit claim scope and clock.
    pub async fn execute_at(
        &self,
        attempt_id: &str,
        scope: ClaimScope,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        let now_ms = datetime_to_ms(now);
        let request = ClaimRequest {
            id: attempt_id,
            scope,
            now: now_ms,
            stale_before: ms_before(now_ms, self.claim_timeout),
        };

        let claimed = match self.attempts.claim_attempt(request).await {
            Ok(row) => row,
            Err(e) if e.is_claim_conflict() => {
                let reason = self.skip_reason(attempt_id).await?;
                debug!(attempt_id = %attempt_id, ?reason, "Attempt not claimed, skipping");
                return Ok(ExecuteOutcome::Skipped(reason));
            }
            Err(e) => return Err(e),
        };

        let Some(token) = claimed.claim_token.clone() else {
            return Err(Error::Other(format!(
                "Claimed attempt {} has no claim token",
                attempt_id
            )));
        };

        // A panicking provider must not leave the row claimed.
        let result = match AssertUnwindSafe(self.run_claimed(&claimed, &token, now))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::Other(format!(
                "Attempt execution panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Leave the row for the next sweep instead of stuck in flight.
                match self.attempts.release_claim(attempt_id, &token).await {
                    Ok(_) => warn!(attempt_id = %attempt_id, error = %e, "Attempt failed unexpectedly, claim released"),
                    Err(release_err) => warn!(
                        attempt_id = %attempt_id,
                        error = %e,
                        release_error = %release_err,
                        "Attempt failed unexpectedly and claim release failed; it expires after the claim timeout"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn skip_reason(&self, attempt_id: &str) -> Result<SkipReason> {
        let row = self.attempts.get_attempt(attempt_id).await?;
        Ok(if row.is_terminal() {
            SkipReason::AlreadyTerminal
        } else {
            SkipReason::ClaimHeld
        })
    }

    async fn run_claimed(
        &self,
        claimed: &DeliveryAttemptDbModel,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        let expected = claimed.status().ok_or_else(|| {
            Error::Other(format!(
                "Attempt {} has unknown status '{}'",
                claimed.id, claimed.status
            ))
        })?;

        let (resolution, outcome) = match self.send(claimed).await {
            Ok((provider, receipt)) => {
                info!(
                    attempt_id = %claimed.id,
                    channel = %claimed.channel,
                    provider = provider,
                    message_id = %receipt.message_id,
                    "Delivery succeeded"
                );
                let resolution = AttemptResolution {
                    status: DeliveryStatus::Sent,
                    retry_count: claimed.retry_count,
                    next_retry_at: None,
                    provider_message_id: Some(receipt.message_id.clone()),
                    last_error: None,
                    delivery_provider: Some(receipt.provider.to_string()),
                    delivery_metadata: receipt.metadata.as_ref().map(|m| m.to_string()),
                };
                let outcome = ExecuteOutcome::Delivered {
                    provider_message_id: receipt.message_id,
                };
                (resolution, outcome)
            }
            Err((provider, error)) => self.failure_resolution(claimed, provider, error, now),
        };

        match self
            .attempts
            .resolve_attempt(&claimed.id, token, expected, &resolution, datetime_to_ms(now))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_claim_conflict() => {
                // Lease expired mid-send and another executor took the row.
                warn!(attempt_id = %claimed.id, "Claim lost before the outcome was recorded");
                return Ok(ExecuteOutcome::Skipped(SkipReason::ClaimHeld));
            }
            Err(e) => return Err(e),
        }

        if resolution.status == DeliveryStatus::Sent {
            let mut delivered = claimed.clone();
            delivered.status = DeliveryStatus::Sent.as_str().to_string();
            delivered.provider_message_id = resolution.provider_message_id.clone();
            delivered.updated_at = datetime_to_ms(now);
            delivered.claimed_at = None;
            delivered.claim_token = None;
            self.read_state.on_delivered(&delivered).await;
        }

        Ok(outcome)
    }

    /// Hand the row to its provider. The error side carries the provider
    /// name when one was reached.
    async fn send(
        &self,
        attempt: &DeliveryAttemptDbModel,
    ) -> std::result::Result<
        (&'static str, super::channels::ProviderReceipt),
        (Option<&'static str>, ProviderError),
    > {
        let Some(channel) = attempt.delivery_channel() else {
            return Err((
                None,
                ProviderError::permanent(format!("Unknown channel '{}'", attempt.channel)),
            ));
        };

        let Some(provider) = self.registry.get(channel) else {
            return Err((
                None,
                ProviderError::transient(format!("No provider registered for {}", channel)),
            ));
        };

        let content = message_content(attempt, channel).map_err(|e| (None, e))?;
        let message = OutboundMessage {
            attempt_id: attempt.id.clone(),
            channel,
            recipient: attempt.recipient.clone(),
            content,
        };

        let name = provider.provider_name();
        debug!(attempt_id = %attempt.id, channel = %channel, provider = name, retry_count = attempt.retry_count, "Sending");
        provider
            .send(&message)
            .await
            .map(|receipt| (name, receipt))
            .map_err(|e| (Some(name), e))
    }

    fn failure_resolution(
        &self,
        attempt: &DeliveryAttemptDbModel,
        provider: Option<&'static str>,
        error: ProviderError,
        now: DateTime<Utc>,
    ) -> (AttemptResolution, ExecuteOutcome) {
        let detail = error.to_string();
        let metadata = error.metadata.as_ref().map(|m| m.to_string());
        let delivery_provider = provider.map(str::to_string);

        if error.is_transient() {
            let retry_count = attempt.retry_count.saturating_add(1);
            if self.retry_policy.should_retry(retry_count.max(0) as u32) {
                let next_retry_at = self.retry_policy.next_retry_at(now, retry_count as u32);
                warn!(
                    attempt_id = %attempt.id,
                    channel = %attempt.channel,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    error = %detail,
                    "Transient delivery failure, retry scheduled"
                );
                return (
                    AttemptResolution {
                        status: DeliveryStatus::Failed,
                        retry_count,
                        next_retry_at: Some(datetime_to_ms(next_retry_at)),
                        provider_message_id: None,
                        last_error: Some(detail),
                        delivery_provider,
                        delivery_metadata: metadata,
                    },
                    ExecuteOutcome::RetryScheduled {
                        retry_count,
                        next_retry_at,
                    },
                );
            }

            warn!(
                attempt_id = %attempt.id,
                channel = %attempt.channel,
                retry_count,
                error = %detail,
                "Retries exhausted, attempt permanently failed"
            );
            return (
                AttemptResolution {
                    status: DeliveryStatus::PermanentlyFailed,
                    retry_count,
                    next_retry_at: None,
                    provider_message_id: None,
                    last_error: Some(detail.clone()),
                    delivery_provider,
                    delivery_metadata: metadata,
                },
                ExecuteOutcome::PermanentlyFailed { reason: detail },
            );
        }

        warn!(
            attempt_id = %attempt.id,
            channel = %attempt.channel,
            error = %detail,
            "Permanent delivery failure"
        );
        (
            AttemptResolution {
                status: DeliveryStatus::PermanentlyFailed,
                retry_count: attempt.retry_count,
                next_retry_at: None,
                provider_message_id: None,
                last_error: Some(detail.clone()),
                delivery_provider,
                delivery_metadata: metadata,
            },
            ExecuteOutcome::PermanentlyFailed { reason: detail },
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Provider payload for a stored row: a template reference when the row
/// carries one without a body, otherwise the rendered text.
fn message_content(
    attempt: &DeliveryAttemptDbModel,
    channel: DeliveryChannel,
) -> std::result::Result<MessageContent, ProviderError> {
    match (&attempt.content, &attempt.template_ref) {
        (Some(body), _) => Ok(MessageContent::Text {
            body: body.clone(),
            subject: attempt.subject.clone(),
        }),
        (None, Some(template_ref)) if channel == DeliveryChannel::ChatTemplated => {
            Ok(MessageContent::Template {
                name: template_ref.clone(),
                language: attempt.template_language.clone(),
                parameters: attempt.parameters(),
            })
        }
        _ => Err(ProviderError::permanent(format!(
            "Attempt has no content to send on {}",
            channel
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(channel: DeliveryChannel) -> DeliveryAttemptDbModel {
        DeliveryAttemptDbModel::new(channel, "u-1", "+15550001111", "order_status_changed")
    }

    #[test]
    fn test_text_content() {
        let mut row = attempt(DeliveryChannel::Email);
        row.content = Some("Body".to_string());
        row.subject = Some("Subject".to_string());
        assert_eq!(
            message_content(&row, DeliveryChannel::Email).unwrap(),
            MessageContent::Text {
                body: "Body".to_string(),
                subject: Some("Subject".to_string())
            }
        );
    }

    #[test]
    fn test_template_content() {
        let mut row = attempt(DeliveryChannel::ChatTemplated);
        row.template_ref = Some("order_update".to_string());
        row.template_language = Some("en_US".to_string());
        row.rendered_parameters = Some(r#"["A-1","shipped"]"#.to_string());
        assert_eq!(
            message_content(&row, DeliveryChannel::ChatTemplated).unwrap(),
            MessageContent::Template {
                name: "order_update".to_string(),
                language: Some("en_US".to_string()),
                parameters: vec!["A-1".to_string(), "shipped".to_string()],
            }
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(format!("bad {}", 1));
        assert_eq!(panic_message(payload.as_ref()), "bad 1");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_missing_content_is_permanent() {
        let mut row = attempt(DeliveryChannel::Sms);
        row.template_ref = Some("local-template-id".to_string());
        let err = message_content(&row, DeliveryChannel::Sms).unwrap_err();
        assert!(!err.is_transient());
    }
}
