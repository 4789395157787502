//! Repository for message templates.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Template, TemplateId},
};

/// Repository for template database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared connection pool.
    #[cfg(test)]
    pub(crate) fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a template.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the name is taken.
    pub async fn create(&self, template: &Template) -> Result<TemplateId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO templates (id, name, channel, subject, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(template.id.0)
        .bind(&template.name)
        .bind(template.channel.to_string())
        .bind(&template.subject)
        .bind(&template.body)
        .bind(template.created_at)
        .bind(template.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(TemplateId(id))
    }

    /// Finds a template by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: TemplateId) -> Result<Option<Template>> {
        let template = sqlx::query_as::<_, Template>(
            r#"
            SELECT id, name, channel, subject, body, created_at, updated_at
            FROM templates
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(template)
    }

    /// Finds a template by its unique name.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Template>> {
        let template = sqlx::query_as::<_, Template>(
            r#"
            SELECT id, name, channel, subject, body, created_at, updated_at
            FROM templates
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
