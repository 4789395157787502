//! Domain models and strongly-typed identifiers.
//!
//! Defines notifications, templates and audit events, together with the
//! lifecycle state machine the dispatch engine drives notifications through.
//! Enum columns are stored as lowercase text and decoded through `sqlx`.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
pub use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Free-form JSON key/value map used for template data and metadata.
pub type DataMap = HashMap<String, serde_json::Value>;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

macro_rules! text_enum_sqlx {
    ($name:ident) => {
        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse().map_err(|e: CoreError| e.to_string().into())
            }
        }
    };
}

uuid_id!(
    /// Identifier of a notification. Assigned at creation and never changed.
    NotificationId
);

uuid_id!(
    /// Identifier of a stored message template.
    TemplateId
);

uuid_id!(
    /// Identifier of an audit trail entry.
    AuditEventId
);

/// Delivery channel a notification is sent through.
///
/// The set is closed: every kind maps to exactly one adapter configured at
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Electronic mail.
    Email,
    /// Short message service.
    Sms,
    /// Mobile or browser push alert.
    Push,
}

impl ChannelKind {
    /// All channel kinds in a stable order.
    pub const ALL: [Self; 3] = [Self::Email, Self::Sms, Self::Push];

    /// Lowercase name as stored and exposed over the API.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "push" => Ok(Self::Push),
            _ => Err(CoreError::InvalidInput(format!("unknown channel: {s}"))),
        }
    }
}

text_enum_sqlx!(ChannelKind);

/// Notification lifecycle status.
///
/// ```text
/// Queued ──▶ Pending ──▶ Delivered
///    │         │  ▲
///    │         └──┘ (next attempt)
///    │         │
///    └─────────┴──▶ Failed
/// ```
///
/// `Delivered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Accepted and waiting for the dispatcher.
    Queued,
    /// At least one delivery attempt has started.
    Pending,
    /// Terminal success.
    Delivered,
    /// Terminal failure.
    Failed,
}

impl NotificationStatus {
    /// Returns true for states with no outgoing transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Pending | Self::Failed)
                | (Self::Pending, Self::Pending | Self::Delivered | Self::Failed)
        )
    }

    /// Lowercase name as stored and exposed over the API.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::InvalidInput(format!("invalid notification status: {s}"))),
        }
    }
}

text_enum_sqlx!(NotificationStatus);

/// Caller-supplied priority. Stored and reported, never used for scheduling.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// High priority.
    High,
    /// Critical priority.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(CoreError::InvalidInput(format!("invalid priority: {s}"))),
        }
    }
}

text_enum_sqlx!(Priority);

/// A unit of delivery work and its lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    /// Unique identifier.
    pub id: NotificationId,

    /// Channel used for delivery.
    pub channel: ChannelKind,

    /// Address in the channel's format (email address, phone number, device
    /// token).
    pub recipient: String,

    /// Rendered subject, if the channel uses one.
    pub subject: Option<String>,

    /// Rendered message body.
    pub body: String,

    /// Template the body was rendered from.
    pub template_id: Option<TemplateId>,

    /// Values substituted into the template.
    pub template_data: Json<DataMap>,

    /// Lifecycle status.
    pub status: NotificationStatus,

    /// Priority hint.
    pub priority: Priority,

    /// Earliest time the feeder may pick the notification up.
    pub scheduled_at: Option<DateTime<Utc>>,

    /// When the notification was accepted.
    pub created_at: DateTime<Utc>,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,

    /// Delivery attempts made so far.
    pub attempts: i32,

    /// When the most recent attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Set exactly when the status is `Delivered`.
    pub delivered_at: Option<DateTime<Utc>>,

    /// Error from the final failed attempt.
    pub error_message: Option<String>,

    /// Name of the channel adapter that delivered the notification.
    pub provider: Option<String>,

    /// Caller-supplied metadata, stored untouched.
    pub metadata: Json<DataMap>,
}

impl Notification {
    /// Creates a notification in `Queued` with no attempts.
    pub fn queued(
        channel: ChannelKind,
        recipient: impl Into<String>,
        subject: Option<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            channel,
            recipient: recipient.into(),
            subject,
            body: body.into(),
            template_id: None,
            template_data: Json(DataMap::new()),
            status: NotificationStatus::Queued,
            priority: Priority::Normal,
            scheduled_at: None,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_attempt_at: None,
            delivered_at: None,
            error_message: None,
            provider: None,
            metadata: Json(DataMap::new()),
        }
    }

    /// Records the template and data the body was rendered from.
    #[must_use]
    pub fn with_template(mut self, template_id: TemplateId, data: DataMap) -> Self {
        self.template_id = Some(template_id);
        self.template_data = Json(data);
        self
    }

    /// Sets the priority hint.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Defers pickup by the feeder until `at`.
    #[must_use]
    pub fn with_scheduled_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Attaches caller metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: DataMap) -> Self {
        self.metadata = Json(metadata);
        self
    }

    /// Whether the feeder may dispatch this notification at `now`.
    ///
    /// `pending` counts as due so an interrupted dispatch is picked up again.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Starts a new delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the notification is
    /// terminal.
    pub fn mark_pending(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(NotificationStatus::Pending, now)?;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// Records a successful delivery by `provider`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless an attempt is in
    /// progress.
    pub fn mark_delivered(
        &mut self,
        provider: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(NotificationStatus::Delivered, now)?;
        self.delivered_at = Some(now);
        self.provider = Some(provider.into());
        self.error_message = None;
        Ok(())
    }

    /// Records a terminal failure.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the notification is already
    /// terminal.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(NotificationStatus::Failed, now)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, next: NotificationStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Kind of lifecycle transition recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Notification accepted.
    Created,
    /// Notification delivered.
    Delivered,
    /// Notification failed permanently.
    Failed,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "CREATED",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        })
    }
}

impl FromStr for AuditEventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(Self::Created),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            _ => Err(CoreError::InvalidInput(format!("invalid audit event type: {s}"))),
        }
    }
}

text_enum_sqlx!(AuditEventType);

/// Immutable, append-only record of a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    /// Unique identifier.
    pub id: AuditEventId,

    /// Notification the event refers to.
    pub notification_id: NotificationId,

    /// Transition that happened.
    pub event_type: AuditEventType,

    /// Small structured payload describing the transition.
    pub event_data: Json<DataMap>,

    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    fn new(
        notification_id: NotificationId,
        event_type: AuditEventType,
        event_data: DataMap,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditEventId::new(),
            notification_id,
            event_type,
            event_data: Json(event_data),
            created_at: now,
        }
    }

    /// `CREATED` event carrying channel and recipient.
    pub fn created(notification: &Notification, now: DateTime<Utc>) -> Self {
        let data = DataMap::from([
            ("channel".to_string(), notification.channel.as_str().into()),
            ("recipient".to_string(), notification.recipient.clone().into()),
        ]);
        Self::new(notification.id, AuditEventType::Created, data, now)
    }

    /// `DELIVERED` event carrying provider and attempt count.
    pub fn delivered(notification: &Notification, now: DateTime<Utc>) -> Self {
        let data = DataMap::from([
            ("provider".to_string(), notification.provider.clone().into()),
            ("attempts".to_string(), notification.attempts.into()),
        ]);
        Self::new(notification.id, AuditEventType::Delivered, data, now)
    }

    /// `FAILED` event carrying the error and attempt count.
    pub fn failed(notification: &Notification, now: DateTime<Utc>) -> Self {
        let data = DataMap::from([
            ("error".to_string(), notification.error_message.clone().into()),
            ("attempts".to_string(), notification.attempts.into()),
        ]);
        Self::new(notification.id, AuditEventType::Failed, data, now)
    }
}

/// Stored message template with `{{placeholder}}` markers.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Template {
    /// Unique identifier.
    pub id: TemplateId,

    /// Human-readable unique name.
    pub name: String,

    /// Channel the template is written for.
    pub channel: ChannelKind,

    /// Subject template, for channels that use one.
    pub subject: Option<String>,

    /// Body template.
    pub body: String,

    /// When the template was created.
    pub created_at: DateTime<Utc>,

    /// When the template was last changed.
    pub updated_at: DateTime<Utc>,
}

impl Template {
    /// Creates a template stamped with `now`.
    pub fn new(
        name: impl Into<String>,
        channel: ChannelKind,
        subject: Option<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TemplateId::new(),
            name: name.into(),
            channel,
            subject,
            body: body.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> Notification {
        Notification::queued(ChannelKind::Email, "user@example.com", None, "hello", Utc::now())
    }

    #[test]
    fn new_notification_is_queued_without_attempts() {
        let notification = queued();

        assert_eq!(notification.status, NotificationStatus::Queued);
        assert_eq!(notification.attempts, 0);
        assert!(notification.delivered_at.is_none());
    }

    #[test]
    fn pending_increments_attempts_each_time() {
        let mut notification = queued();
        let now = Utc::now();

        notification.mark_pending(now).unwrap();
        notification.mark_pending(now).unwrap();

        assert_eq!(notification.status, NotificationStatus::Pending);
        assert_eq!(notification.attempts, 2);
        assert_eq!(notification.last_attempt_at, Some(now));
    }

    #[test]
    fn delivered_requires_an_attempt() {
        let mut notification = queued();

        let err = notification.mark_delivered("email", Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert!(notification.delivered_at.is_none());
    }

    #[test]
    fn delivered_sets_timestamp_and_provider() {
        let mut notification = queued();
        notification.mark_pending(Utc::now()).unwrap();
        notification.mark_delivered("email", Utc::now()).unwrap();

        assert_eq!(notification.status, NotificationStatus::Delivered);
        assert!(notification.delivered_at.is_some());
        assert_eq!(notification.provider.as_deref(), Some("email"));
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let mut failed = queued();
        failed.mark_failed("boom", Utc::now()).unwrap();

        assert!(failed.mark_pending(Utc::now()).is_err());
        assert!(failed.mark_delivered("email", Utc::now()).is_err());
        assert!(failed.mark_failed("again", Utc::now()).is_err());
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert_eq!(failed.attempts, 0);
    }

    #[test]
    fn scheduled_notification_is_not_due_early() {
        let now = Utc::now();
        let later = now + chrono::Duration::minutes(5);
        let notification = queued().with_scheduled_at(Some(later));

        assert!(!notification.is_due(now));
        assert!(notification.is_due(later));
    }

    #[test]
    fn pending_is_due_and_terminal_is_not() {
        let now = Utc::now();
        let mut notification = queued();

        notification.mark_pending(now).unwrap();
        assert!(notification.is_due(now));

        notification.mark_delivered("email", now).unwrap();
        assert!(!notification.is_due(now));
    }

    #[test]
    fn enum_names_round_trip_through_text() {
        for kind in ChannelKind::ALL {
            assert_eq!(kind.as_str().parse::<ChannelKind>().unwrap(), kind);
        }
        assert_eq!("pending".parse::<NotificationStatus>().unwrap(), NotificationStatus::Pending);
        assert_eq!("FAILED".parse::<AuditEventType>().unwrap(), AuditEventType::Failed);
        assert!("fax".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn audit_payloads_describe_the_transition() {
        let mut notification = queued();
        notification.mark_pending(Utc::now()).unwrap();
        notification.mark_failed("provider rejected", Utc::now()).unwrap();

        let event = AuditEvent::failed(&notification, Utc::now());

        assert_eq!(event.event_type, AuditEventType::Failed);
        assert_eq!(event.notification_id, notification.id);
        assert_eq!(event.event_data.0["error"], "provider rejected");
        assert_eq!(event.event_data.0["attempts"], 1);
    }
}
