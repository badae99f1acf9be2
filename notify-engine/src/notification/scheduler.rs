//! Retry sweep.
//!
//! A single timer picks up FAILED rows whose retry time has passed, plus
//! PENDING rows that were never executed, and runs each through the
//! dispatch pool. Each row is claimed by the executor before any provider
//! call, so a sweep racing a direct execution settles on one winner.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::database::repositories::{ClaimScope, DeliveryAttemptRepository};
use crate::database::time::{datetime_to_ms, ms_before};
use crate::{Error, Result};

use super::dispatch::DeliveryDispatcher;
use super::executor::{ExecuteOutcome, SkipReason};

/// Minimum spacing between retention passes.
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows the due query returned.
    pub due: usize,
    /// Rows an executor actually ran.
    pub dispatched: usize,
    /// Rows skipped because another executor held them.
    pub conflicts: usize,
    /// Rows whose execution failed unexpectedly.
    pub failures: usize,
}

/// Drives FAILED and stale PENDING rows back through the executor.
pub struct DeliveryScheduler {
    attempts: Arc<dyn DeliveryAttemptRepository>,
    dispatcher: Arc<DeliveryDispatcher>,
    config: SchedulerConfig,
    cancellation_token: CancellationToken,
}

impl DeliveryScheduler {
    pub fn new(
        attempts: Arc<dyn DeliveryAttemptRepository>,
        dispatcher: Arc<DeliveryDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_cancellation(attempts, dispatcher, config, CancellationToken::new())
    }

    /// Create a scheduler stopped by a shared token.
    pub fn with_cancellation(
        attempts: Arc<dyn DeliveryAttemptRepository>,
        dispatcher: Arc<DeliveryDispatcher>,
        config: SchedulerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            attempts,
            dispatcher,
            config,
            cancellation_token,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Spawn the sweep loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop().await })
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_prune: Option<Instant> = None;

        info!(
            interval_secs = self.config.sweep_interval().as_secs(),
            batch_size = self.config.batch_size,
            "Delivery scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.sweep_once().await {
                Ok(report) if report.due > 0 => info!(?report, "Retry sweep finished"),
                Ok(_) => debug!("Retry sweep found nothing due"),
                // Nothing is assumed changed; the next tick retries.
                Err(e) => error!(error = %e, "Retry sweep failed"),
            }

            if self.config.retention_days.is_some()
                && last_prune.is_none_or(|at| at.elapsed() >= RETENTION_INTERVAL)
            {
                last_prune = Some(Instant::now());
                if let Err(e) = self.prune_at(Utc::now()).await {
                    warn!(error = %e, "Delivery log retention failed");
                }
            }
        }

        info!("Delivery scheduler stopped");
    }

    /// Sweep against the wall clock.
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let now_ms = datetime_to_ms(now);
        let stale_before = ms_before(now_ms, self.config.claim_timeout());

        let due = self
            .attempts
            .list_due(now_ms, stale_before, self.config.batch_size)
            .await
            .map_err(|e| Error::SchedulerSweep(e.to_string()))?;

        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let ids = due.into_iter().map(|row| row.id).collect();
        for (id, result) in self.dispatcher.run_batch(ids, ClaimScope::Due, now).await {
            match result {
                Ok(ExecuteOutcome::Skipped(SkipReason::ClaimHeld)) => report.conflicts += 1,
                Ok(ExecuteOutcome::Skipped(SkipReason::AlreadyTerminal)) => {}
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!(attempt_id = %id, error = %e, "Sweep execution failed");
                }
            }
        }

        Ok(report)
    }

    /// Delete terminal rows older than the retention window. No-op when
    /// retention is disabled.
    pub async fn prune_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let Some(retention) = self.config.retention() else {
            return Ok(0);
        };
        let cutoff = ms_before(datetime_to_ms(now), retention);
        let pruned = self.attempts.prune_terminal_before(cutoff).await?;
        if pruned > 0 {
            info!(pruned, "Pruned terminal delivery attempts");
        }
        Ok(pruned)
    }
}
