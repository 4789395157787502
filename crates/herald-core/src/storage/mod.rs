//! Database access layer implementing the repository pattern for
//! notification persistence.
//!
//! Each table has its own repository sharing one connection pool. All SQL
//! lives in this module.

use std::sync::Arc;

use sqlx::PgPool;

pub mod audit_logs;
pub mod notifications;
pub mod templates;

use crate::error::Result;

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Repository for notification records.
    pub notifications: Arc<notifications::Repository>,

    /// Repository for the append-only audit trail.
    pub audit_logs: Arc<audit_logs::Repository>,

    /// Repository for message templates.
    pub templates: Arc<templates::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            notifications: Arc::new(notifications::Repository::new(pool.clone())),
            audit_logs: Arc::new(audit_logs::Repository::new(pool.clone())),
            templates: Arc::new(templates::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.notifications.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);

        assert!(Arc::ptr_eq(&storage.notifications.pool(), &storage.templates.pool()));
    }
}
