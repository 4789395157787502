//! Repository for notification records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Notification, NotificationId},
};

const COLUMNS: &str = "id, channel, recipient, subject, body, template_id, template_data, \
                       status, priority, scheduled_at, created_at, updated_at, attempts, \
                       last_attempt_at, delivered_at, error_message, provider, metadata";

/// Repository for notification database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new notification.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or the id already exists.
    pub async fn create(&self, notification: &Notification) -> Result<NotificationId> {
        let n = notification;
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO notifications (
                id, channel, recipient, subject, body, template_id, template_data,
                status, priority, scheduled_at, created_at, updated_at, attempts,
                last_attempt_at, delivered_at, error_message, provider, metadata
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
            )
            RETURNING id
            "#,
        )
        .bind(n.id.0)
        .bind(n.channel.to_string())
        .bind(&n.recipient)
        .bind(&n.subject)
        .bind(&n.body)
        .bind(n.template_id.map(|t| t.0))
        .bind(&n.template_data)
        .bind(n.status.to_string())
        .bind(n.priority.to_string())
        .bind(n.scheduled_at)
        .bind(n.created_at)
        .bind(n.updated_at)
        .bind(n.attempts)
        .bind(n.last_attempt_at)
        .bind(n.delivered_at)
        .bind(&n.error_message)
        .bind(&n.provider)
        .bind(&n.metadata)
        .fetch_one(&*self.pool)
        .await?;

        Ok(NotificationId(id))
    }

    /// Finds a notification by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>> {
        let query = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1");
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(notification)
    }

    /// Writes the mutable lifecycle fields of a notification.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row has the notification's id.
    pub async fn update(&self, n: &Notification) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                updated_at = $3,
                attempts = $4,
                last_attempt_at = $5,
                delivered_at = $6,
                error_message = $7,
                provider = $8
            WHERE id = $1
            "#,
        )
        .bind(n.id.0)
        .bind(n.status.to_string())
        .bind(n.updated_at)
        .bind(n.attempts)
        .bind(n.last_attempt_at)
        .bind(n.delivered_at)
        .bind(&n.error_message)
        .bind(&n.provider)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("notification {}", n.id)));
        }

        Ok(())
    }

    /// Returns queued or pending notifications due at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        let query = format!(
            "SELECT {COLUMNS} FROM notifications \
             WHERE status IN ('queued', 'pending') \
               AND (scheduled_at IS NULL OR scheduled_at <= $1) \
             ORDER BY created_at ASC \
             LIMIT $2"
        );
        let notifications = sqlx::query_as::<_, Notification>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(notifications)
    }
}
