//! Push channel backed by an HTTP push gateway.
//!
//! The recipient is the device token. The subject becomes the alert title
//! and notification metadata is forwarded as the data payload.

use std::time::Duration;

use async_trait::async_trait;
use herald_core::Notification;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{default_timeout_ms, gateway::GatewayClient};
use crate::{
    channel::{ChannelAdapter, SendOutcome},
    error::Result,
};

/// Push channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Push gateway endpoint.
    pub api_url: String,
    /// Gateway API key, sent as a bearer token.
    pub api_key: String,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: String::new(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Push channel adapter.
#[derive(Debug)]
pub struct PushChannel {
    config: PushConfig,
    gateway: GatewayClient,
}

impl PushChannel {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: PushConfig) -> Result<Self> {
        let gateway = GatewayClient::new(
            "push",
            config.api_url.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.timeout_ms),
        )?;
        Ok(Self { config, gateway })
    }
}

#[async_trait]
impl ChannelAdapter for PushChannel {
    fn name(&self) -> &str {
        "push"
    }

    async fn health_check(&self) -> bool {
        self.config.enabled && self.gateway.is_configured()
    }

    async fn send(&self, notification: &Notification) -> Result<SendOutcome> {
        if !self.config.enabled {
            return Ok(SendOutcome::rejected(
                Some("CHANNEL_DISABLED".to_string()),
                "push channel is disabled",
            ));
        }

        let payload = json!({
            "token": notification.recipient,
            "title": notification.subject.as_deref().unwrap_or_default(),
            "body": notification.body,
            "data": notification.metadata.0,
            "notification_id": notification.id.to_string(),
        });

        self.gateway.post(&payload).await
    }
}
