//! Storage abstraction for the dispatch engine.
//!
//! The dispatcher only sees [`NotificationStore`]. Production wires in
//! [`PostgresNotificationStore`]; tests use [`mock::InMemoryNotificationStore`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result, storage::Storage, AuditEvent, Notification, NotificationId, Template,
    TemplateId,
};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations the dispatch engine depends on.
pub trait NotificationStore: Send + Sync + 'static {
    /// Inserts a new notification.
    fn create(&self, notification: Notification) -> StoreFuture<'_, ()>;

    /// Loads a notification by id.
    fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<Notification>>;

    /// Overwrites the lifecycle fields of an existing notification.
    fn update(&self, notification: Notification) -> StoreFuture<'_, ()>;

    /// Queued or pending notifications due at `now`, oldest first, at most
    /// `limit`.
    fn find_pending_notifications(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<Notification>>;

    /// Appends an audit event.
    fn create_audit_log(&self, event: AuditEvent) -> StoreFuture<'_, ()>;

    /// Loads a template by id.
    fn find_template(&self, id: TemplateId) -> StoreFuture<'_, Option<Template>>;

    /// Loads a template by its unique name.
    fn find_template_by_name(&self, name: String) -> StoreFuture<'_, Option<Template>>;

    /// Inserts a new template.
    fn create_template(&self, template: Template) -> StoreFuture<'_, ()>;

    /// Audit trail of one notification in insertion order.
    fn find_audit_logs(&self, id: NotificationId) -> StoreFuture<'_, Vec<AuditEvent>>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}

/// PostgreSQL-backed store over the core repositories.
pub struct PostgresNotificationStore {
    storage: Arc<Storage>,
}

impl PostgresNotificationStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl NotificationStore for PostgresNotificationStore {
    fn create(&self, notification: Notification) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.notifications.create(&notification).await.map(|_| ()) })
    }

    fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<Notification>> {
        Box::pin(async move { self.storage.notifications.find_by_id(id).await })
    }

    fn update(&self, notification: Notification) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.notifications.update(&notification).await })
    }

    fn find_pending_notifications(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Vec<Notification>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move { self.storage.notifications.find_pending(now, limit).await })
    }

    fn create_audit_log(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.audit_logs.create(&event).await.map(|_| ()) })
    }

    fn find_template(&self, id: TemplateId) -> StoreFuture<'_, Option<Template>> {
        Box::pin(async move { self.storage.templates.find_by_id(id).await })
    }

    fn find_template_by_name(&self, name: String) -> StoreFuture<'_, Option<Template>> {
        Box::pin(async move { self.storage.templates.find_by_name(&name).await })
    }

    fn create_template(&self, template: Template) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.templates.create(&template).await.map(|_| ()) })
    }

    fn find_audit_logs(&self, id: NotificationId) -> StoreFuture<'_, Vec<AuditEvent>> {
        Box::pin(async move { self.storage.audit_logs.find_by_notification(id).await })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory store for tests.
    //!
    //! Records every call in order and can be told to fail specific
    //! operations, so tests can assert both what was persisted and what was
    //! never attempted.

    use std::collections::{HashMap, HashSet};

    use chrono::{DateTime, Utc};
    use herald_core::{
        error::Result, AuditEvent, CoreError, Notification, NotificationId, Template, TemplateId,
    };
    use tokio::sync::RwLock;

    use super::{NotificationStore, StoreFuture};

    /// Store operation, used for the call log and failure injection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum StoreOp {
        /// `create`
        Create,
        /// `find_by_id`
        FindById,
        /// `update`
        Update,
        /// `find_pending_notifications`
        FindPending,
        /// `create_audit_log`
        CreateAuditLog,
        /// `find_template`
        FindTemplate,
        /// `find_template_by_name`
        FindTemplateByName,
        /// `create_template`
        CreateTemplate,
        /// `find_audit_logs`
        FindAuditLogs,
        /// `health_check`
        HealthCheck,
    }

    /// In-memory [`NotificationStore`].
    #[derive(Debug, Default)]
    pub struct InMemoryNotificationStore {
        notifications: RwLock<HashMap<NotificationId, Notification>>,
        audit_logs: RwLock<Vec<AuditEvent>>,
        templates: RwLock<HashMap<TemplateId, Template>>,
        calls: RwLock<Vec<StoreOp>>,
        failing: RwLock<HashSet<StoreOp>>,
    }

    impl InMemoryNotificationStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds a template.
        pub async fn insert_template(&self, template: Template) {
            self.templates.write().await.insert(template.id, template);
        }

        /// Adds a notification without logging a call.
        pub async fn insert_notification(&self, notification: Notification) {
            self.notifications.write().await.insert(notification.id, notification);
        }

        /// Makes every later call of `op` fail with a database error.
        pub async fn fail_on(&self, op: StoreOp) {
            self.failing.write().await.insert(op);
        }

        /// Removes all injected failures.
        pub async fn clear_failures(&self) {
            self.failing.write().await.clear();
        }

        /// Every call made so far, in order.
        pub async fn calls(&self) -> Vec<StoreOp> {
            self.calls.read().await.clone()
        }

        /// Number of calls of `op` made so far.
        pub async fn call_count(&self, op: StoreOp) -> usize {
            self.calls.read().await.iter().filter(|call| **call == op).count()
        }

        /// Current copy of a stored notification.
        pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
            self.notifications.read().await.get(&id).cloned()
        }

        /// Every audit event recorded so far.
        pub async fn audit_events(&self) -> Vec<AuditEvent> {
            self.audit_logs.read().await.clone()
        }

        async fn enter(&self, op: StoreOp) -> Result<()> {
            self.calls.write().await.push(op);
            if self.failing.read().await.contains(&op) {
                return Err(CoreError::Database(format!("injected failure for {op:?}")));
            }
            Ok(())
        }
    }

    impl NotificationStore for InMemoryNotificationStore {
        fn create(&self, notification: Notification) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.enter(StoreOp::Create).await?;
                let mut notifications = self.notifications.write().await;
                if notifications.contains_key(&notification.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "notification {} already exists",
                        notification.id
                    )));
                }
                notifications.insert(notification.id, notification);
                Ok(())
            })
        }

        fn find_by_id(&self, id: NotificationId) -> StoreFuture<'_, Option<Notification>> {
            Box::pin(async move {
                self.enter(StoreOp::FindById).await?;
                Ok(self.notifications.read().await.get(&id).cloned())
            })
        }

        fn update(&self, notification: Notification) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.enter(StoreOp::Update).await?;
                let mut notifications = self.notifications.write().await;
                match notifications.get_mut(&notification.id) {
                    Some(stored) => {
                        *stored = notification;
                        Ok(())
                    },
                    None => Err(CoreError::NotFound(format!("notification {}", notification.id))),
                }
            })
        }

        fn find_pending_notifications(
            &self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> StoreFuture<'_, Vec<Notification>> {
            Box::pin(async move {
                self.enter(StoreOp::FindPending).await?;
                let mut due: Vec<Notification> = self
                    .notifications
                    .read()
                    .await
                    .values()
                    .filter(|n| n.is_due(now))
                    .cloned()
                    .collect();
                due.sort_by_key(|n| n.created_at);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn create_audit_log(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.enter(StoreOp::CreateAuditLog).await?;
                if !self.notifications.read().await.contains_key(&event.notification_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "audit event references unknown notification {}",
                        event.notification_id
                    )));
                }
                self.audit_logs.write().await.push(event);
                Ok(())
            })
        }

        fn find_template(&self, id: TemplateId) -> StoreFuture<'_, Option<Template>> {
            Box::pin(async move {
                self.enter(StoreOp::FindTemplate).await?;
                Ok(self.templates.read().await.get(&id).cloned())
            })
        }

        fn find_template_by_name(&self, name: String) -> StoreFuture<'_, Option<Template>> {
            Box::pin(async move {
                self.enter(StoreOp::FindTemplateByName).await?;
                Ok(self.templates.read().await.values().find(|t| t.name == name).cloned())
            })
        }

        fn create_template(&self, template: Template) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.enter(StoreOp::CreateTemplate).await?;
                let mut templates = self.templates.write().await;
                if templates.values().any(|t| t.name == template.name) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "template name {} already exists",
                        template.name
                    )));
                }
                templates.insert(template.id, template);
                Ok(())
            })
        }

        fn find_audit_logs(&self, id: NotificationId) -> StoreFuture<'_, Vec<AuditEvent>> {
            Box::pin(async move {
                self.enter(StoreOp::FindAuditLogs).await?;
                Ok(self
                    .audit_logs
                    .read()
                    .await
                    .iter()
                    .filter(|event| event.notification_id == id)
                    .cloned()
                    .collect())
            })
        }

        fn health_check(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move { self.enter(StoreOp::HealthCheck).await })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use herald_core::{ChannelKind, NotificationStatus};

    use super::{
        mock::{InMemoryNotificationStore, StoreOp},
        *,
    };

    fn notification(created_at: DateTime<Utc>) -> Notification {
        Notification::queued(ChannelKind::Email, "a@example.com", None, "hi", created_at)
    }

    #[tokio::test]
    async fn pending_excludes_future_and_terminal() {
        let store = InMemoryNotificationStore::new();
        let now = Utc::now();

        let due = notification(now - Duration::seconds(2));
        let later = notification(now - Duration::seconds(3))
            .with_scheduled_at(Some(now + Duration::minutes(1)));
        let mut delivered = notification(now - Duration::seconds(4));
        delivered.status = NotificationStatus::Delivered;

        for n in [due.clone(), later, delivered] {
            store.create(n).await.unwrap();
        }

        let pending = store.find_pending_notifications(10, now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, due.id);
    }

    #[tokio::test]
    async fn interrupted_pending_notifications_are_returned() {
        let store = InMemoryNotificationStore::new();
        let now = Utc::now();
        let mut interrupted = notification(now - Duration::seconds(5));
        interrupted.mark_pending(now - Duration::seconds(4)).unwrap();
        store.create(interrupted.clone()).await.unwrap();

        let pending = store.find_pending_notifications(10, now).await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, interrupted.id);
        assert_eq!(pending[0].status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn pending_is_ordered_oldest_first_and_limited() {
        let store = InMemoryNotificationStore::new();
        let now = Utc::now();
        let oldest = notification(now - Duration::seconds(30));
        let middle = notification(now - Duration::seconds(20));
        let newest = notification(now - Duration::seconds(10));

        for n in [newest, oldest.clone(), middle.clone()] {
            store.create(n).await.unwrap();
        }

        let pending = store.find_pending_notifications(2, now).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![oldest.id, middle.id]);
    }

    #[tokio::test]
    async fn injected_failures_are_logged_and_returned() {
        let store = InMemoryNotificationStore::new();
        store.fail_on(StoreOp::Update).await;

        let result = store.update(notification(Utc::now())).await;

        assert!(result.is_err());
        assert_eq!(store.calls().await, vec![StoreOp::Update]);
    }

    #[tokio::test]
    async fn template_names_are_unique() {
        let store = InMemoryNotificationStore::new();
        let first = Template::new("otp", ChannelKind::Sms, None, "{{code}}", Utc::now());
        let clash = Template::new("otp", ChannelKind::Sms, None, "again", Utc::now());

        store.create_template(first.clone()).await.unwrap();
        let result = store.create_template(clash).await;

        assert!(matches!(result, Err(herald_core::CoreError::ConstraintViolation(_))));
        let found = store.find_template_by_name("otp".to_string()).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn audit_log_requires_existing_notification() {
        let store = InMemoryNotificationStore::new();
        let orphan = notification(Utc::now());

        let result = store.create_audit_log(AuditEvent::created(&orphan, Utc::now())).await;

        assert!(matches!(result, Err(herald_core::CoreError::ConstraintViolation(_))));
    }
}
