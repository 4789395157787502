//! Channel adapter contract and the registry that maps channel kinds to
//! adapters.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use herald_core::{ChannelKind, Notification};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Result of handing a notification to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    /// Whether the provider accepted the message.
    pub success: bool,
    /// Provider message id on success, reason on failure.
    pub message: String,
    /// Provider error code, if any.
    pub error_code: Option<String>,
}

impl SendOutcome {
    /// Provider accepted the message.
    pub fn delivered(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), error_code: None }
    }

    /// Provider rejected the message.
    pub fn rejected(error_code: Option<String>, message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), error_code }
    }
}

/// A delivery channel such as email, SMS or push.
///
/// Routine failures (provider rejections, disabled adapter) come back as an
/// unsuccessful [`SendOutcome`]. Transport faults come back as `Err`. The
/// dispatcher retries both.
#[async_trait]
pub trait ChannelAdapter: Send + Sync + fmt::Debug {
    /// Stable adapter name, also used as the circuit breaker key.
    fn name(&self) -> &str;

    /// Cheap readiness probe. Never delivers anything.
    async fn health_check(&self) -> bool;

    /// Delivers one notification.
    async fn send(&self, notification: &Notification) -> Result<SendOutcome>;
}

/// Fixed mapping from channel kind to adapter, built at startup.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter` for `kind`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, kind: ChannelKind, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(kind, adapter);
        self
    }

    /// Adapter for `kind`, if one is registered.
    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Registered adapters in channel order.
    pub fn adapters(&self) -> Vec<Arc<dyn ChannelAdapter>> {
        ChannelKind::ALL.iter().filter_map(|kind| self.get(*kind)).collect()
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Named(&'static str);

    #[async_trait]
    impl ChannelAdapter for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn send(&self, _notification: &Notification) -> Result<SendOutcome> {
            Ok(SendOutcome::delivered("ok"))
        }
    }

    #[test]
    fn registry_returns_none_for_unregistered_kind() {
        let registry = ChannelRegistry::new().with(ChannelKind::Email, Arc::new(Named("email")));

        assert!(registry.get(ChannelKind::Email).is_some());
        assert!(registry.get(ChannelKind::Sms).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn adapters_are_listed_in_channel_order() {
        let registry = ChannelRegistry::new()
            .with(ChannelKind::Push, Arc::new(Named("push")))
            .with(ChannelKind::Email, Arc::new(Named("email")));

        let names: Vec<String> =
            registry.adapters().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["email", "push"]);
    }
}
