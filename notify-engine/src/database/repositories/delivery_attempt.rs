//! Delivery attempt repository.
//!
//! Every status change goes through a compare-and-set keyed by row id plus
//! the claim token handed out by [`DeliveryAttemptRepository::claim_attempt`],
//! so a concurrent sweep and a direct execution can never both finalize the
//! same attempt.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    DeliveryAttemptDbModel, DeliveryAttemptFilter, DeliveryStatus, DeliveryStatusCounts,
    Pagination,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Which rows a claim may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope {
    /// Any non-terminal row that is not under a live claim.
    Any,
    /// Only rows the scheduler considers due at `now`: FAILED rows whose
    /// `next_retry_at` has passed and PENDING rows older than the claim
    /// timeout.
    Due,
}

/// Parameters for a claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub id: &'a str,
    pub scope: ClaimScope,
    /// Wall clock used for the lease (epoch ms).
    pub now: i64,
    /// Claims taken at or before this instant are expired (epoch ms).
    pub stale_before: i64,
}

/// New state written when an in-flight attempt resolves.
#[derive(Debug, Clone)]
pub struct AttemptResolution {
    pub status: DeliveryStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<i64>,
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
    pub delivery_provider: Option<String>,
    pub delivery_metadata: Option<String>,
}

/// Delivery attempt repository trait.
#[async_trait]
pub trait DeliveryAttemptRepository: Send + Sync {
    async fn create_attempt(&self, attempt: &DeliveryAttemptDbModel) -> Result<()>;
    async fn get_attempt(&self, id: &str) -> Result<DeliveryAttemptDbModel>;

    /// Take an exclusive lease on a row. Returns the claimed row (carrying
    /// its fresh `claim_token`) or `Error::ClaimConflict` when the row is
    /// terminal, under a live claim, or outside `scope`.
    async fn claim_attempt(&self, request: ClaimRequest<'_>) -> Result<DeliveryAttemptDbModel>;

    /// Write the outcome of an attempt and drop the claim.
    ///
    /// Applies only if the row still carries `claim_token` and is still in
    /// `expected`; otherwise `Error::ClaimConflict`.
    async fn resolve_attempt(
        &self,
        id: &str,
        claim_token: &str,
        expected: DeliveryStatus,
        resolution: &AttemptResolution,
        now: i64,
    ) -> Result<()>;

    /// Drop a claim without touching the status. Returns whether the claim
    /// was still held.
    async fn release_claim(&self, id: &str, claim_token: &str) -> Result<bool>;

    /// Rows the scheduler should pick up at `now`, oldest due first.
    async fn list_due(&self, now: i64, stale_before: i64, limit: u32)
    -> Result<Vec<DeliveryAttemptDbModel>>;

    async fn list_attempts_filtered(
        &self,
        filter: &DeliveryAttemptFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<DeliveryAttemptDbModel>, u64)>;

    async fn status_counts(&self) -> Result<DeliveryStatusCounts>;

    /// Move a PERMANENTLY_FAILED row back to PENDING with a fresh retry budget.
    async fn reset_for_redrive(&self, id: &str, now: i64) -> Result<()>;

    /// Delete terminal rows created before `cutoff`. Returns the number removed.
    async fn prune_terminal_before(&self, cutoff: i64) -> Result<u64>;
}

/// SQLx implementation of DeliveryAttemptRepository.
pub struct SqlxDeliveryAttemptRepository {
    pool: SqlitePool,
}

impl SqlxDeliveryAttemptRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn claim_conflict_or_missing(&self, id: &str) -> Error {
        match self.get_attempt(id).await {
            Ok(_) => Error::ClaimConflict { id: id.to_string() },
            Err(e) => e,
        }
    }
}

const DUE_PREDICATE: &str = "((status = 'FAILED' AND next_retry_at IS NOT NULL AND next_retry_at <= ?) \
     OR (status = 'PENDING' AND created_at <= ?))";

#[async_trait]
impl DeliveryAttemptRepository for SqlxDeliveryAttemptRepository {
    async fn create_attempt(&self, attempt: &DeliveryAttemptDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_attempt", || async {
            sqlx::query(
                r#"
                INSERT INTO delivery_attempt (
                    id, notification_ref, recipient_user_id, channel, recipient, event_type,
                    template_ref, template_name, template_language, rendered_parameters,
                    subject, content,
                    status, provider_message_id, last_error, retry_count, next_retry_at,
                    delivery_provider, delivery_metadata, context_refs, claimed_at, claim_token,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&attempt.id)
            .bind(&attempt.notification_ref)
            .bind(&attempt.recipient_user_id)
            .bind(&attempt.channel)
            .bind(&attempt.recipient)
            .bind(&attempt.event_type)
            .bind(&attempt.template_ref)
            .bind(&attempt.template_name)
            .bind(&attempt.template_language)
            .bind(&attempt.rendered_parameters)
            .bind(&attempt.subject)
            .bind(&attempt.content)
            .bind(&attempt.status)
            .bind(&attempt.provider_message_id)
            .bind(&attempt.last_error)
            .bind(attempt.retry_count)
            .bind(attempt.next_retry_at)
            .bind(&attempt.delivery_provider)
            .bind(&attempt.delivery_metadata)
            .bind(&attempt.context_refs)
            .bind(attempt.claimed_at)
            .bind(&attempt.claim_token)
            .bind(attempt.created_at)
            .bind(attempt.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_attempt(&self, id: &str) -> Result<DeliveryAttemptDbModel> {
        sqlx::query_as::<_, DeliveryAttemptDbModel>("SELECT * FROM delivery_attempt WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("DeliveryAttempt", id))
    }

    async fn claim_attempt(&self, request: ClaimRequest<'_>) -> Result<DeliveryAttemptDbModel> {
        let token = uuid::Uuid::new_v4().to_string();

        let scope_predicate = match request.scope {
            ClaimScope::Any => "status IN ('PENDING', 'FAILED')".to_string(),
            ClaimScope::Due => DUE_PREDICATE.to_string(),
        };
        let sql = format!(
            "UPDATE delivery_attempt SET claimed_at = ?, claim_token = ? \
             WHERE id = ? AND {} AND (claimed_at IS NULL OR claimed_at <= ?)",
            scope_predicate
        );

        let affected = retry_on_sqlite_busy("claim_attempt", || async {
            let mut query = sqlx::query(&sql)
                .bind(request.now)
                .bind(&token)
                .bind(request.id);
            if request.scope == ClaimScope::Due {
                query = query.bind(request.now).bind(request.stale_before);
            }
            let result = query.bind(request.stale_before).execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(self.claim_conflict_or_missing(request.id).await);
        }

        let claimed = sqlx::query_as::<_, DeliveryAttemptDbModel>(
            "SELECT * FROM delivery_attempt WHERE id = ? AND claim_token = ?",
        )
        .bind(request.id)
        .bind(&token)
        .fetch_optional(&self.pool)
        .await?;

        // The lease can only vanish here if it expired and was re-taken.
        claimed.ok_or_else(|| Error::ClaimConflict {
            id: request.id.to_string(),
        })
    }

    async fn resolve_attempt(
        &self,
        id: &str,
        claim_token: &str,
        expected: DeliveryStatus,
        resolution: &AttemptResolution,
        now: i64,
    ) -> Result<()> {
        if !expected.can_transition_to(resolution.status) {
            return Err(Error::invalid_transition(
                expected.as_str(),
                resolution.status.as_str(),
            ));
        }

        let affected = retry_on_sqlite_busy("resolve_attempt", || async {
            let result = sqlx::query(
                r#"
                UPDATE delivery_attempt SET
                    status = ?,
                    retry_count = ?,
                    next_retry_at = ?,
                    provider_message_id = COALESCE(?, provider_message_id),
                    last_error = ?,
                    delivery_provider = COALESCE(?, delivery_provider),
                    delivery_metadata = COALESCE(?, delivery_metadata),
                    claimed_at = NULL,
                    claim_token = NULL,
                    updated_at = ?
                WHERE id = ? AND claim_token = ? AND status = ?
                "#,
            )
            .bind(resolution.status.as_str())
            .bind(resolution.retry_count)
            .bind(resolution.next_retry_at)
            .bind(&resolution.provider_message_id)
            .bind(&resolution.last_error)
            .bind(&resolution.delivery_provider)
            .bind(&resolution.delivery_metadata)
            .bind(now)
            .bind(id)
            .bind(claim_token)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::ClaimConflict { id: id.to_string() });
        }
        Ok(())
    }

    async fn release_claim(&self, id: &str, claim_token: &str) -> Result<bool> {
        let affected = retry_on_sqlite_busy("release_claim", || async {
            let result = sqlx::query(
                "UPDATE delivery_attempt SET claimed_at = NULL, claim_token = NULL WHERE id = ? AND claim_token = ?",
            )
            .bind(id)
            .bind(claim_token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;
        Ok(affected > 0)
    }

    async fn list_due(
        &self,
        now: i64,
        stale_before: i64,
        limit: u32,
    ) -> Result<Vec<DeliveryAttemptDbModel>> {
        let sql = format!(
            "SELECT * FROM delivery_attempt WHERE {} AND (claimed_at IS NULL OR claimed_at <= ?) \
             ORDER BY COALESCE(next_retry_at, created_at) ASC LIMIT ?",
            DUE_PREDICATE
        );
        let rows = sqlx::query_as::<_, DeliveryAttemptDbModel>(&sql)
            .bind(now)
            .bind(stale_before)
            .bind(stale_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn list_attempts_filtered(
        &self,
        filter: &DeliveryAttemptFilter,
        pagination: &Pagination,
    ) -> Result<(Vec<DeliveryAttemptDbModel>, u64)> {
        let mut conditions = Vec::new();

        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        if filter.recipient.is_some() {
            conditions.push("recipient = ?");
        }
        if filter.template_name.is_some() {
            conditions.push("template_name = ?");
        }
        if filter.created_from.is_some() {
            conditions.push("created_at >= ?");
        }
        if filter.created_to.is_some() {
            conditions.push("created_at < ?");
        }
        if filter.min_retry_count.is_some() {
            conditions.push("retry_count >= ?");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM delivery_attempt {}", where_clause);
        let data_sql = format!(
            "SELECT * FROM delivery_attempt {} ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            where_clause
        );

        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(status) = filter.status {
            count_query = count_query.bind(status.as_str());
        }
        if let Some(ref recipient) = filter.recipient {
            count_query = count_query.bind(recipient);
        }
        if let Some(ref template_name) = filter.template_name {
            count_query = count_query.bind(template_name);
        }
        if let Some(from) = filter.created_from {
            count_query = count_query.bind(from);
        }
        if let Some(to) = filter.created_to {
            count_query = count_query.bind(to);
        }
        if let Some(retry_count) = filter.min_retry_count {
            count_query = count_query.bind(retry_count);
        }
        let total = count_query.fetch_one(&self.pool).await? as u64;

        let mut data_query = sqlx::query_as::<_, DeliveryAttemptDbModel>(&data_sql);
        if let Some(status) = filter.status {
            data_query = data_query.bind(status.as_str());
        }
        if let Some(ref recipient) = filter.recipient {
            data_query = data_query.bind(recipient);
        }
        if let Some(ref template_name) = filter.template_name {
            data_query = data_query.bind(template_name);
        }
        if let Some(from) = filter.created_from {
            data_query = data_query.bind(from);
        }
        if let Some(to) = filter.created_to {
            data_query = data_query.bind(to);
        }
        if let Some(retry_count) = filter.min_retry_count {
            data_query = data_query.bind(retry_count);
        }
        data_query = data_query.bind(pagination.limit as i64);
        data_query = data_query.bind(pagination.offset as i64);

        let rows = data_query.fetch_all(&self.pool).await?;

        Ok((rows, total))
    }

    async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM delivery_attempt GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = DeliveryStatusCounts::default();
        for (status, count) in rows {
            let count = count as u64;
            match DeliveryStatus::parse(&status) {
                Some(DeliveryStatus::Pending) => counts.pending = count,
                Some(DeliveryStatus::Sent) => counts.sent = count,
                Some(DeliveryStatus::Failed) => counts.failed = count,
                Some(DeliveryStatus::PermanentlyFailed) => counts.permanently_failed = count,
                None => tracing::warn!(status = %status, "Unknown delivery status in store"),
            }
        }
        Ok(counts)
    }

    async fn reset_for_redrive(&self, id: &str, now: i64) -> Result<()> {
        let affected = retry_on_sqlite_busy("reset_for_redrive", || async {
            let result = sqlx::query(
                r#"
                UPDATE delivery_attempt SET
                    status = 'PENDING',
                    retry_count = 0,
                    next_retry_at = NULL,
                    last_error = NULL,
                    claimed_at = NULL,
                    claim_token = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'PERMANENTLY_FAILED'
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            let current = self.get_attempt(id).await?;
            return Err(Error::invalid_transition(
                current.status,
                DeliveryStatus::Pending.as_str(),
            ));
        }
        Ok(())
    }

    async fn prune_terminal_before(&self, cutoff: i64) -> Result<u64> {
        let affected = retry_on_sqlite_busy("prune_terminal_before", || async {
            let result = sqlx::query(
                "DELETE FROM delivery_attempt WHERE status IN ('SENT', 'PERMANENTLY_FAILED') AND created_at < ?",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;
        Ok(affected)
    }
}
