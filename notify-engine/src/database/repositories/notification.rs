//! Notification, template and audit repositories.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{
    DeliveryAuditDbModel, DeliveryChannel, NotificationDbModel, NotificationTemplateDbModel,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Notification repository trait.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn get_notification(&self, id: &str) -> Result<NotificationDbModel>;
    async fn create_notification(&self, notification: &NotificationDbModel) -> Result<()>;
    /// Set `read_status`. Returns `false` when the notification was already read.
    async fn mark_read(&self, id: &str, read_at: i64) -> Result<bool>;
    async fn list_unread_for_user(&self, user_id: &str, limit: u32)
    -> Result<Vec<NotificationDbModel>>;
}

/// Template repository trait.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn find_template(
        &self,
        notification_type: &str,
        channel: DeliveryChannel,
    ) -> Result<Option<NotificationTemplateDbModel>>;
    /// Insert or replace the template for its `(notification_type, channel)` key.
    async fn upsert_template(&self, template: &NotificationTemplateDbModel) -> Result<()>;
    async fn list_templates(&self) -> Result<Vec<NotificationTemplateDbModel>>;
}

/// Audit repository trait.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn add_entry(&self, entry: &DeliveryAuditDbModel) -> Result<()>;
    async fn list_for_attempt(&self, attempt_id: &str) -> Result<Vec<DeliveryAuditDbModel>>;
    async fn list_recent(&self, limit: u32) -> Result<Vec<DeliveryAuditDbModel>>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn get_notification(&self, id: &str) -> Result<NotificationDbModel> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn create_notification(&self, notification: &NotificationDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification (
                id, user_id, notification_type, message, read_status,
                related_order_id, related_booking_id, created_at, read_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.notification_type)
        .bind(&notification.message)
        .bind(notification.read_status)
        .bind(&notification.related_order_id)
        .bind(&notification.related_booking_id)
        .bind(notification.created_at)
        .bind(notification.read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_read(&self, id: &str, read_at: i64) -> Result<bool> {
        let affected = retry_on_sqlite_busy("mark_notification_read", || async {
            let result = sqlx::query(
                "UPDATE notification SET read_status = 1, read_at = ? WHERE id = ? AND read_status = 0",
            )
            .bind(read_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            // Distinguish "already read" from "no such notification".
            self.get_notification(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_unread_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            "SELECT * FROM notification WHERE user_id = ? AND read_status = 0 ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// SQLx implementation of TemplateRepository.
pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn find_template(
        &self,
        notification_type: &str,
        channel: DeliveryChannel,
    ) -> Result<Option<NotificationTemplateDbModel>> {
        let template = sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_template WHERE notification_type = ? AND channel = ?",
        )
        .bind(notification_type)
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(template)
    }

    async fn upsert_template(&self, template: &NotificationTemplateDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_template (
                id, name, notification_type, channel, body, subject,
                provider_template_ref, language, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(notification_type, channel) DO UPDATE SET
                name = excluded.name,
                body = excluded.body,
                subject = excluded.subject,
                provider_template_ref = excluded.provider_template_ref,
                language = excluded.language
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.notification_type)
        .bind(&template.channel)
        .bind(&template.body)
        .bind(&template.subject)
        .bind(&template.provider_template_ref)
        .bind(&template.language)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<NotificationTemplateDbModel>> {
        let templates = sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_template ORDER BY notification_type, channel",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }
}

/// SQLx implementation of AuditRepository.
pub struct SqlxAuditRepository {
    pool: SqlitePool,
}

impl SqlxAuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditRepository for SqlxAuditRepository {
    async fn add_entry(&self, entry: &DeliveryAuditDbModel) -> Result<()> {
        retry_on_sqlite_busy("add_audit_entry", || async {
            sqlx::query(
                r#"
                INSERT INTO delivery_audit (id, attempt_id, action, actor, detail, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.attempt_id)
            .bind(&entry.action)
            .bind(&entry.actor)
            .bind(&entry.detail)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_for_attempt(&self, attempt_id: &str) -> Result<Vec<DeliveryAuditDbModel>> {
        let entries = sqlx::query_as::<_, DeliveryAuditDbModel>(
            "SELECT * FROM delivery_audit WHERE attempt_id = ? ORDER BY created_at",
        )
        .bind(attempt_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<DeliveryAuditDbModel>> {
        let entries = sqlx::query_as::<_, DeliveryAuditDbModel>(
            "SELECT * FROM delivery_audit ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::run_migrations;
    use crate::database::models::AuditAction;

    async fn setup_test_db() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("repo.db").display());
        let pool = SqlitePool::connect(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let (_dir, pool) = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);

        let notification = NotificationDbModel::new("user-1", "order_status_changed", "Shipped");
        repo.create_notification(&notification).await.unwrap();

        assert!(repo.mark_read(&notification.id, 1_000).await.unwrap());
        assert!(!repo.mark_read(&notification.id, 2_000).await.unwrap());

        let stored = repo.get_notification(&notification.id).await.unwrap();
        assert!(stored.read_status);
        assert_eq!(stored.read_at, Some(1_000));
        assert!(repo.list_unread_for_user("user-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_unknown_is_not_found() {
        let (_dir, pool) = setup_test_db().await;
        let repo = SqlxNotificationRepository::new(pool);
        let err = repo.mark_read("missing", 1).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_template_upsert_replaces_by_key() {
        let (_dir, pool) = setup_test_db().await;
        let repo = SqlxTemplateRepository::new(pool);

        let first = NotificationTemplateDbModel::new(
            "order_email_v1",
            "order_cancelled",
            DeliveryChannel::Email,
            "Order {order_id} cancelled",
        );
        repo.upsert_template(&first).await.unwrap();

        let second = NotificationTemplateDbModel::new(
            "order_email_v2",
            "order_cancelled",
            DeliveryChannel::Email,
            "Your order {order_id} was cancelled",
        )
        .with_subject("Order cancelled");
        repo.upsert_template(&second).await.unwrap();

        let found = repo
            .find_template("order_cancelled", DeliveryChannel::Email)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "order_email_v2");
        assert_eq!(found.subject.as_deref(), Some("Order cancelled"));
        assert!(
            repo.find_template("order_cancelled", DeliveryChannel::Sms)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(repo.list_templates().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_audit_entries() {
        let (_dir, pool) = setup_test_db().await;
        let repo = SqlxAuditRepository::new(pool);

        let entry = DeliveryAuditDbModel::new(
            Some("attempt-1".to_string()),
            AuditAction::Redrive,
            "ops@example.com",
            r#"{"reason":"provider outage"}"#,
        );
        repo.add_entry(&entry).await.unwrap();

        let entries = repo.list_for_attempt("attempt-1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "REDRIVE");
        assert_eq!(repo.list_recent(10).await.unwrap().len(), 1);
    }
}
