//! SMS channel backed by an HTTP messaging gateway.

use std::time::Duration;

use async_trait::async_trait;
use herald_core::Notification;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    default_timeout_ms,
    gateway::{truncate, GatewayClient},
};
use crate::{
    channel::{ChannelAdapter, SendOutcome},
    error::Result,
};

/// Longest body sent to the gateway, in characters (ten concatenated
/// segments).
pub const MAX_SMS_LENGTH: usize = 1600;

/// SMS channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Messaging gateway endpoint.
    pub api_url: String,
    /// Gateway API key, sent as a bearer token.
    pub api_key: String,
    /// Sender number or alphanumeric id.
    pub from_number: String,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: String::new(),
            api_key: String::new(),
            from_number: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// SMS channel adapter.
#[derive(Debug)]
pub struct SmsChannel {
    config: SmsConfig,
    gateway: GatewayClient,
}

impl SmsChannel {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: SmsConfig) -> Result<Self> {
        let gateway = GatewayClient::new(
            "sms",
            config.api_url.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.timeout_ms),
        )?;
        Ok(Self { config, gateway })
    }
}

#[async_trait]
impl ChannelAdapter for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    async fn health_check(&self) -> bool {
        self.config.enabled && self.gateway.is_configured()
    }

    async fn send(&self, notification: &Notification) -> Result<SendOutcome> {
        if !self.config.enabled {
            return Ok(SendOutcome::rejected(
                Some("CHANNEL_DISABLED".to_string()),
                "sms channel is disabled",
            ));
        }

        let payload = json!({
            "from": self.config.from_number,
            "to": notification.recipient,
            "body": truncate(&notification.body, MAX_SMS_LENGTH),
            "notification_id": notification.id.to_string(),
        });

        self.gateway.post(&payload).await
    }
}
