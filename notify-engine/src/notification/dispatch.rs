//! Bounded worker pool for executor invocations.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::database::repositories::ClaimScope;
use crate::{Error, Result};

use super::executor::{DeliveryExecutor, ExecuteOutcome};

/// Caps concurrent provider calls and tracks spawned work for shutdown.
pub struct DeliveryDispatcher {
    executor: Arc<DeliveryExecutor>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    max_concurrency: usize,
}

impl DeliveryDispatcher {
    pub fn new(executor: Arc<DeliveryExecutor>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            tracker: TaskTracker::new(),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Execute an attempt inside a pool slot and wait for its outcome.
    pub async fn run(&self, attempt_id: &str) -> Result<ExecuteOutcome> {
        self.run_at(attempt_id, ClaimScope::Any, Utc::now()).await
    }

    /// [`Self::run`] with an explicit claim scope and clock.
    pub async fn run_at(
        &self,
        attempt_id: &str,
        scope: ClaimScope,
        now: DateTime<Utc>,
    ) -> Result<ExecuteOutcome> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Other(format!("Dispatch pool closed: {}", e)))?;
        self.executor.execute_at(attempt_id, scope, now).await
    }

    /// Execute several attempts, each on its own task, and collect every
    /// outcome. A task that dies is reported as an error for its attempt
    /// instead of taking the batch down with it.
    pub async fn run_batch(
        self: &Arc<Self>,
        attempt_ids: Vec<String>,
        scope: ClaimScope,
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<ExecuteOutcome>)> {
        let mut tasks = JoinSet::new();
        let mut ids = HashMap::with_capacity(attempt_ids.len());
        let mut results = Vec::with_capacity(attempt_ids.len());

        for attempt_id in attempt_ids {
            let dispatcher = Arc::clone(self);
            let id = attempt_id.clone();
            let handle = tasks.spawn(self.tracker.track_future(async move {
                dispatcher.run_at(&id, scope, now).await
            }));
            ids.insert(handle.id(), attempt_id);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((task_id, result)) => {
                    if let Some(attempt_id) = ids.remove(&task_id) {
                        results.push((attempt_id, result));
                    }
                }
                Err(join_err) => {
                    let Some(attempt_id) = ids.remove(&join_err.id()) else {
                        continue;
                    };
                    let reason = if join_err.is_panic() {
                        "panicked"
                    } else {
                        "was cancelled"
                    };
                    error!(attempt_id = %attempt_id, error = ?join_err, "Attempt task {}", reason);
                    results.push((
                        attempt_id,
                        Err(Error::Other(format!("Attempt task {}", reason))),
                    ));
                }
            }
        }

        results
    }

    /// Run arbitrary engine work on the tracker so shutdown waits for it.
    pub(crate) fn spawn_task<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return false;
        }
        self.tracker.spawn(task);
        true
    }

    /// Refuse new background work. In-flight tasks keep running.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait for every spawned task. Call [`Self::close`] first.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Close and drain.
    pub async fn shutdown(&self) {
        self.close();
        self.wait().await;
    }
}
