//! Repository for the append-only audit trail. Rows are only ever inserted.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AuditEvent, AuditEventId, NotificationId},
};

/// Repository for audit event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an audit event.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, including when the referenced
    /// notification does not exist.
    pub async fn create(&self, event: &AuditEvent) -> Result<AuditEventId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO audit_logs (id, notification_id, event_type, event_data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(event.id.0)
        .bind(event.notification_id.0)
        .bind(event.event_type.to_string())
        .bind(&event.event_data)
        .bind(event.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(AuditEventId(id))
    }

    /// Returns the audit trail of one notification in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_notification(
        &self,
        notification_id: NotificationId,
    ) -> Result<Vec<AuditEvent>> {
        let events = sqlx::query_as::<_, AuditEvent>(
            r#"
            SELECT id, notification_id, event_type, event_data, created_at
            FROM audit_logs
            WHERE notification_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(notification_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }
}
