//! Dispatch engine.
//!
//! Turns a queued notification into a delivered or failed one. Each attempt
//! goes through the retry policy, then the channel's circuit breaker, then
//! the channel adapter.
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────────┐   ┌─────────────────┐
//! │ Dispatcher │──▶│ RetryExecutor│──▶│ CircuitBreaker  │──▶│ ChannelAdapter  │
//! └────────────┘   └──────────────┘   └─────────────────┘   └─────────────────┘
//!       │
//!       ▼
//! ┌──────────────────┐
//! │ NotificationStore│  lifecycle updates and audit trail
//! └──────────────────┘
//! ```
//!
//! Delivery failures never escape [`Dispatcher::process_notification`]; they
//! end as a `failed` notification with an audit event. Persistence errors and
//! a missing adapter do escape.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use herald_core::{
    AuditEvent, ChannelKind, Clock, Notification, NotificationId, NotificationStatus, Priority,
    Template, TemplateId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    channel::{ChannelAdapter, ChannelRegistry, SendOutcome},
    circuit::{CircuitBreaker, CircuitBreakerManager, CircuitConfig, CircuitSnapshot},
    error::{DispatchError, ErrorCategory, Result},
    retry::{RetryExecutor, RetryPolicy},
    storage::NotificationStore,
    template,
};

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchConfig {
    /// Retry policy applied to every notification.
    pub retry_policy: RetryPolicy,
    /// Breaker configuration shared by all channels.
    pub circuit: CircuitConfig,
}

/// Request to create a notification.
///
/// Exactly one of `template_id` and `body` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNotificationRequest {
    /// Delivery channel.
    pub channel: ChannelKind,
    /// Channel-specific address.
    pub recipient: String,
    /// Subject used with an explicit body, or when the template has none.
    #[serde(default)]
    pub subject: Option<String>,
    /// Explicit message body.
    #[serde(default)]
    pub body: Option<String>,
    /// Template to render the body from.
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    /// Values for the template placeholders.
    #[serde(default)]
    pub template_data: HashMap<String, Value>,
    /// Priority hint.
    #[serde(default)]
    pub priority: Priority,
    /// Earliest delivery time.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Caller metadata, stored untouched.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CreateNotificationRequest {
    /// Request with an explicit body and no template.
    pub fn with_body(
        channel: ChannelKind,
        recipient: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            recipient: recipient.into(),
            subject: None,
            body: Some(body.into()),
            template_id: None,
            template_data: HashMap::new(),
            priority: Priority::default(),
            scheduled_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Request that renders `template_id` with `data`.
    pub fn with_template(
        channel: ChannelKind,
        recipient: impl Into<String>,
        template_id: TemplateId,
        data: HashMap<String, Value>,
    ) -> Self {
        Self {
            body: None,
            template_id: Some(template_id),
            template_data: data,
            ..Self::with_body(channel, recipient, String::new())
        }
    }
}

/// Request to register a message template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplateRequest {
    /// Unique name.
    pub name: String,
    /// Channel the template is written for.
    pub channel: ChannelKind,
    /// Subject template.
    #[serde(default)]
    pub subject: Option<String>,
    /// Body template.
    pub body: String,
}

/// Response to a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCreated {
    /// New notification id.
    pub id: NotificationId,
    /// Always `queued`.
    pub status: NotificationStatus,
    /// Acceptance time.
    pub created_at: DateTime<Utc>,
}

/// Externally visible state of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStatusView {
    /// Notification id.
    pub id: NotificationId,
    /// Delivery channel.
    pub channel: ChannelKind,
    /// Lifecycle status.
    pub status: NotificationStatus,
    /// Priority hint.
    pub priority: Priority,
    /// Attempts made so far.
    pub attempts: i32,
    /// Acceptance time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Earliest delivery time, if deferred.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Start of the most recent attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Delivery time.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Final error, for failed notifications.
    pub error_message: Option<String>,
    /// Adapter that delivered the notification.
    pub provider: Option<String>,
}

impl From<Notification> for NotificationStatusView {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            channel: n.channel,
            status: n.status,
            priority: n.priority,
            attempts: n.attempts,
            created_at: n.created_at,
            updated_at: n.updated_at,
            scheduled_at: n.scheduled_at,
            last_attempt_at: n.last_attempt_at,
            delivered_at: n.delivered_at,
            error_message: n.error_message,
            provider: n.provider,
        }
    }
}

/// Identity of one dispatch, carried into every log line as a span.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Notification being dispatched.
    pub notification_id: NotificationId,
    /// Its channel.
    pub channel: ChannelKind,
    /// Its recipient.
    pub recipient: String,
}

impl DispatchContext {
    /// Span covering the whole dispatch.
    pub fn span(&self) -> Span {
        info_span!(
            "dispatch",
            notification_id = %self.notification_id,
            channel = %self.channel,
            recipient = %self.recipient,
        )
    }
}

impl From<&Notification> for DispatchContext {
    fn from(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            channel: notification.channel,
            recipient: notification.recipient.clone(),
        }
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Notifications taken through a dispatch.
    pub processed: u64,
    /// Ended in `delivered`.
    pub delivered: u64,
    /// Ended in `failed`.
    pub failed: u64,
    /// Dispatches aborted by a persistence or configuration error.
    pub errors: u64,
    /// Dispatches currently running.
    pub in_flight: u64,
}

/// How a retried delivery ended.
enum Delivery {
    Sent(SendOutcome),
    Aborted(DispatchError),
}

/// Coordinates adapters, breakers, retries and persistence.
pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    registry: ChannelRegistry,
    breakers: CircuitBreakerManager,
    retry: RetryExecutor,
    clock: Arc<dyn Clock>,
    stats: RwLock<DispatchStats>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: ChannelRegistry,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            breakers: CircuitBreakerManager::new(config.circuit, clock.clone()),
            retry: RetryExecutor::new(config.retry_policy, clock.clone()),
            clock,
            stats: RwLock::new(DispatchStats::default()),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Validates a request, renders its template if any, persists a queued
    /// notification and records `CREATED`.
    ///
    /// # Errors
    ///
    /// - `Validation` for a bad request, before anything is persisted
    /// - `Persistence` if the store fails
    pub async fn create_notification(
        &self,
        request: CreateNotificationRequest,
    ) -> Result<NotificationCreated> {
        if request.recipient.trim().is_empty() {
            return Err(DispatchError::validation("recipient must not be empty"));
        }

        let (subject, body, template_id) = match (request.template_id, request.body) {
            (Some(_), Some(_)) => {
                return Err(DispatchError::validation(
                    "provide either template_id or body, not both",
                ));
            },
            (None, None) => {
                return Err(DispatchError::validation("either template_id or body is required"));
            },
            (None, Some(body)) => {
                if body.trim().is_empty() {
                    return Err(DispatchError::validation("body must not be empty"));
                }
                (request.subject, body, None)
            },
            (Some(template_id), None) => {
                let template = self.store.find_template(template_id).await?.ok_or_else(|| {
                    DispatchError::validation(format!("template {template_id} not found"))
                })?;
                if template.channel != request.channel {
                    return Err(DispatchError::validation(format!(
                        "template {template_id} is for channel {}, not {}",
                        template.channel, request.channel
                    )));
                }
                let subject = template::render_subject(&template, &request.template_data)
                    .or(request.subject);
                let body = template::render(&template, &request.template_data);
                (subject, body, Some(template_id))
            },
        };

        let now = self.clock.now_utc();
        let mut notification =
            Notification::queued(request.channel, request.recipient, subject, body, now)
                .with_priority(request.priority)
                .with_scheduled_at(request.scheduled_at)
                .with_metadata(request.metadata);
        if let Some(template_id) = template_id {
            notification = notification.with_template(template_id, request.template_data);
        }

        self.store.create(notification.clone()).await?;
        self.store.create_audit_log(AuditEvent::created(&notification, now)).await?;

        info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            priority = %notification.priority,
            "notification queued"
        );

        Ok(NotificationCreated {
            id: notification.id,
            status: notification.status,
            created_at: notification.created_at,
        })
    }

    /// Registers a template under a new unique name.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty name or body, or a name already in use
    /// - `Persistence` if the store fails
    pub async fn create_template(&self, request: CreateTemplateRequest) -> Result<Template> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(DispatchError::validation("template name must not be empty"));
        }
        if request.body.trim().is_empty() {
            return Err(DispatchError::validation("template body must not be empty"));
        }
        if self.store.find_template_by_name(name.to_string()).await?.is_some() {
            return Err(DispatchError::validation(format!("template {name} already exists")));
        }

        let now = self.clock.now_utc();
        let template = Template::new(name, request.channel, request.subject, request.body, now);
        self.store.create_template(template.clone()).await?;

        info!(
            template_id = %template.id,
            name = %template.name,
            channel = %template.channel,
            "template created"
        );

        Ok(template)
    }

    /// Current state of a notification.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is unknown, `Persistence` if the store fails.
    pub async fn get_notification_status(
        &self,
        id: NotificationId,
    ) -> Result<NotificationStatusView> {
        self.store
            .find_by_id(id)
            .await?
            .map(NotificationStatusView::from)
            .ok_or_else(|| DispatchError::not_found(format!("notification {id} not found")))
    }

    /// Audit trail of a notification, oldest first.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id is unknown, `Persistence` if the store fails.
    pub async fn audit_trail(&self, id: NotificationId) -> Result<Vec<AuditEvent>> {
        if self.store.find_by_id(id).await?.is_none() {
            return Err(DispatchError::not_found(format!("notification {id} not found")));
        }
        Ok(self.store.find_audit_logs(id).await?)
    }

    /// Drives a notification to a terminal state.
    ///
    /// Terminal notifications are returned unchanged. Delivery failures are
    /// recorded on the returned notification rather than returned as errors.
    ///
    /// # Errors
    ///
    /// - `Configuration` if no adapter is registered for the channel; the
    ///   notification is marked failed first
    /// - `Persistence` if a lifecycle update or audit write fails
    pub async fn process_notification(&self, notification: Notification) -> Result<Notification> {
        let span = DispatchContext::from(&notification).span();

        async move {
            if notification.status.is_terminal() {
                debug!(status = %notification.status, "notification already terminal, skipping");
                return Ok(notification);
            }

            self.stats.write().await.in_flight += 1;
            let result = self.dispatch(notification).await;

            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.processed += 1;
            match &result {
                Ok(n) if n.status == NotificationStatus::Delivered => stats.delivered += 1,
                Ok(_) => stats.failed += 1,
                Err(_) => stats.errors += 1,
            }
            drop(stats);

            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, mut notification: Notification) -> Result<Notification> {
        let Some(adapter) = self.registry.get(notification.channel) else {
            let message = format!("no adapter registered for channel {}", notification.channel);
            error!("{message}");

            let now = self.clock.now_utc();
            notification.mark_failed(message.clone(), now)?;
            self.store.update(notification.clone()).await?;
            self.store.create_audit_log(AuditEvent::failed(&notification, now)).await?;

            return Err(DispatchError::configuration(message));
        };

        // A `pending` row left behind by an interrupted dispatch keeps the
        // attempts it already used.
        let used = u32::try_from(notification.attempts).unwrap_or(0);
        let allowed = self.retry.policy().attempts();
        if used >= allowed {
            let message = format!("retries exhausted after {used} attempts");
            warn!(attempts = used, "resumed notification has no attempts left");

            let now = self.clock.now_utc();
            notification.mark_failed(message, now)?;
            self.store.update(notification.clone()).await?;
            self.store.create_audit_log(AuditEvent::failed(&notification, now)).await?;

            return Ok(notification);
        }
        if used > 0 {
            info!(attempts = used, "resuming interrupted dispatch");
        }

        let breaker = self.breakers.breaker(adapter.name()).await;
        let state = Mutex::new(notification);

        let outcome = self
            .retry
            .resume_with_retry("dispatch", used, |attempt| {
                self.attempt(&state, adapter.as_ref(), &breaker, attempt)
            })
            .await;

        let mut notification = state.into_inner();
        let now = self.clock.now_utc();

        match outcome {
            Ok(Delivery::Sent(sent)) => {
                notification.mark_delivered(adapter.name(), now)?;
                self.store.update(notification.clone()).await?;
                self.store.create_audit_log(AuditEvent::delivered(&notification, now)).await?;

                info!(
                    attempts = notification.attempts,
                    provider_message = %sent.message,
                    "notification delivered"
                );
            },
            Ok(Delivery::Aborted(error)) => {
                error!(error = %error, "dispatch aborted");
                return Err(error);
            },
            Err(error) => {
                notification.mark_failed(error.to_string(), now)?;
                self.store.update(notification.clone()).await?;
                self.store.create_audit_log(AuditEvent::failed(&notification, now)).await?;

                warn!(
                    attempts = notification.attempts,
                    error = %error,
                    error_category = %ErrorCategory::from(&error),
                    "notification failed"
                );
            },
        }

        Ok(notification)
    }

    /// One attempt: mark pending, persist, send through the breaker.
    ///
    /// Delivery failures come back as `Err` so the retry policy sees them.
    /// Persistence failures come back as `Ok(Delivery::Aborted)` so it does
    /// not.
    async fn attempt(
        &self,
        state: &Mutex<Notification>,
        adapter: &dyn ChannelAdapter,
        breaker: &CircuitBreaker,
        attempt: u32,
    ) -> Result<Delivery> {
        let snapshot = {
            let mut notification = state.lock().await;
            if let Err(error) = notification.mark_pending(self.clock.now_utc()) {
                return Ok(Delivery::Aborted(error.into()));
            }
            notification.clone()
        };

        debug!(attempt = attempt + 1, "starting delivery attempt");

        if let Err(error) = self.store.update(snapshot.clone()).await {
            return Ok(Delivery::Aborted(error.into()));
        }

        let outcome = breaker
            .execute(|| async {
                let outcome = adapter.send(&snapshot).await?;
                if outcome.success {
                    Ok(outcome)
                } else {
                    let SendOutcome { error_code, message, .. } = outcome;
                    Err(DispatchError::provider(adapter.name(), error_code, message))
                }
            })
            .await;

        match outcome {
            Ok(sent) => Ok(Delivery::Sent(sent)),
            Err(error) => {
                debug!(
                    attempt = attempt + 1,
                    error = %error,
                    error_category = %ErrorCategory::from(&error),
                    "delivery attempt failed"
                );
                Err(error)
            },
        }
    }

    /// Health of every registered adapter, keyed by adapter name.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let adapters = self.registry.adapters();
        let results = join_all(adapters.iter().map(|adapter| adapter.health_check())).await;

        adapters.iter().map(|adapter| adapter.name().to_string()).zip(results).collect()
    }

    /// Breaker state per channel name, for channels used so far.
    pub async fn circuit_states(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers.snapshot().await
    }

    /// Current counters.
    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use herald_core::{Template, TestClock};

    use super::*;
    use crate::storage::mock::{InMemoryNotificationStore, StoreOp};

    #[derive(Debug, Default)]
    struct CountingAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChannelAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "email"
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn send(&self, _notification: &Notification) -> Result<SendOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SendOutcome::delivered("msg-1"))
        }
    }

    fn dispatcher(store: Arc<InMemoryNotificationStore>) -> Dispatcher {
        let registry =
            ChannelRegistry::new().with(ChannelKind::Email, Arc::new(CountingAdapter::default()));
        Dispatcher::new(store, registry, DispatchConfig::default(), Arc::new(TestClock::new()))
    }

    #[tokio::test]
    async fn both_template_and_body_is_rejected() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let mut request = CreateNotificationRequest::with_body(ChannelKind::Email, "a@b.c", "hi");
        request.template_id = Some(TemplateId::new());

        let err = dispatcher.create_notification(request).await.unwrap_err();

        assert!(matches!(err, DispatchError::Validation { .. }));
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn blank_recipient_is_rejected() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let request = CreateNotificationRequest::with_body(ChannelKind::Email, "  ", "hi");

        let err = dispatcher.create_notification(request).await.unwrap_err();

        assert!(matches!(err, DispatchError::Validation { .. }));
    }

    #[tokio::test]
    async fn template_for_other_channel_is_rejected() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let template = Template::new("otp", ChannelKind::Sms, None, "{{code}}", Utc::now());
        let template_id = template.id;
        store.insert_template(template).await;
        let dispatcher = dispatcher(store.clone());

        let request = CreateNotificationRequest::with_template(
            ChannelKind::Email,
            "a@b.c",
            template_id,
            HashMap::new(),
        );
        let err = dispatcher.create_notification(request).await.unwrap_err();

        assert!(matches!(err, DispatchError::Validation { .. }));
        assert_eq!(store.call_count(StoreOp::Create).await, 0);
    }

    #[tokio::test]
    async fn terminal_notification_is_returned_unchanged() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let dispatcher = dispatcher(store.clone());
        let mut notification =
            Notification::queued(ChannelKind::Email, "a@b.c", None, "hi", Utc::now());
        notification.mark_failed("earlier failure", Utc::now()).unwrap();

        let result = dispatcher.process_notification(notification.clone()).await.unwrap();

        assert_eq!(result.status, NotificationStatus::Failed);
        assert_eq!(result.attempts, 0);
        assert!(store.calls().await.is_empty());
        assert_eq!(dispatcher.stats().await.processed, 0);
    }

    #[tokio::test]
    async fn health_check_reports_each_adapter() {
        let dispatcher = dispatcher(Arc::new(InMemoryNotificationStore::new()));

        let health = dispatcher.health_check().await;

        assert_eq!(health.len(), 1);
        assert_eq!(health.get("email"), Some(&true));
    }
}
