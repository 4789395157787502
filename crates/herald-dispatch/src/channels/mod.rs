//! Concrete channel adapters.
//!
//! - Email over a mail gateway
//! - SMS over a messaging gateway
//! - Push over a push gateway
//!
//! All three share [`gateway::GatewayClient`] and differ only in payload.

mod email;
pub mod gateway;
mod push;
mod sms;

pub use email::{EmailChannel, EmailConfig};
pub use push::{PushChannel, PushConfig};
pub use sms::{SmsChannel, SmsConfig, MAX_SMS_LENGTH};

pub(crate) fn default_timeout_ms() -> u64 {
    10_000
}
