//! Core domain models and storage for notification dispatch.
//!
//! Provides strongly-typed identifiers, the notification lifecycle state
//! machine, audit events, templates, the clock abstraction and the
//! PostgreSQL repositories. The dispatch engine and the HTTP surface both
//! build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AuditEvent, AuditEventId, AuditEventType, ChannelKind, Notification, NotificationId,
    NotificationStatus, Priority, Template, TemplateId,
};
pub use time::{Clock, RealClock, TestClock};
