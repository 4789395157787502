//! Email channel backed by an HTTP mail gateway.

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

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Whether the channel is enabled.
    pub enabled: bool,
    /// Mail gateway endpoint.
    pub api_url: String,
    /// Gateway API key, sent as a bearer token.
    pub api_key: String,
    /// Sender address.
    pub from_address: String,
    /// Optional sender display name.
    #[serde(default)]
    pub from_name: Option<String>,
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: String::new(),
            api_key: String::new(),
            from_address: String::new(),
            from_name: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Email channel adapter.
#[derive(Debug)]
pub struct EmailChannel {
    config: EmailConfig,
    gateway: GatewayClient,
}

impl EmailChannel {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: EmailConfig) -> Result<Self> {
        let gateway = GatewayClient::new(
            "email",
            config.api_url.clone(),
            config.api_key.clone(),
            Duration::from_millis(config.timeout_ms),
        )?;
        Ok(Self { config, gateway })
    }

    fn from_header(&self) -> String {
        match &self.config.from_name {
            Some(name) => format!("{name} <{}>", self.config.from_address),
            None => self.config.from_address.clone(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn health_check(&self) -> bool {
        self.config.enabled
            && self.gateway.is_configured()
            && !self.config.from_address.trim().is_empty()
    }

    async fn send(&self, notification: &Notification) -> Result<SendOutcome> {
        if !self.config.enabled {
            return Ok(SendOutcome::rejected(
                Some("CHANNEL_DISABLED".to_string()),
                "email channel is disabled",
            ));
        }

        let payload = json!({
            "from": self.from_header(),
            "to": notification.recipient,
            "subject": notification.subject.as_deref().unwrap_or_default(),
            "body": notification.body,
            "notification_id": notification.id.to_string(),
        });

        self.gateway.post(&payload).await
    }
}
