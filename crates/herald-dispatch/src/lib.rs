//! Notification dispatch engine with bounded retries and per-channel circuit
//! breakers.
//!
//! The [`Dispatcher`] takes a queued notification through its lifecycle:
//!
//! 1. **Resolve adapter** for the notification's channel
//! 2. **Retry** each attempt under the configured delay schedule
//! 3. **Guard** every send with the channel's circuit breaker
//! 4. **Record** the terminal state and an audit event
//!
//! The [`worker::Feeder`] polls the store for queued notifications and hands
//! them to the dispatcher.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{ChannelKind, RealClock};
//! use herald_dispatch::{
//!     channels::{EmailChannel, EmailConfig},
//!     engine::CreateNotificationRequest,
//!     storage::mock::InMemoryNotificationStore,
//!     ChannelRegistry, DispatchConfig, Dispatcher,
//! };
//!
//! # async fn example() -> herald_dispatch::Result<()> {
//! let email = EmailChannel::new(EmailConfig::default())?;
//! let registry = ChannelRegistry::new().with(ChannelKind::Email, Arc::new(email));
//! let dispatcher = Dispatcher::new(
//!     Arc::new(InMemoryNotificationStore::new()),
//!     registry,
//!     DispatchConfig::default(),
//!     Arc::new(RealClock::new()),
//! );
//!
//! let request = CreateNotificationRequest::with_body(ChannelKind::Email, "ada@example.com", "hi");
//! let created = dispatcher.create_notification(request).await?;
//! # let _ = created;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod channels;
pub mod circuit;
pub mod engine;
pub mod error;
pub mod retry;
pub mod storage;
pub mod template;
pub mod worker;

pub use channel::{ChannelAdapter, ChannelRegistry, SendOutcome};
pub use engine::{DispatchConfig, Dispatcher};
pub use error::{DispatchError, Result};
