//! Error types for notification dispatch.
//!
//! Delivery failures (provider rejections, transport faults, open circuits)
//! are absorbed by the dispatcher into a `failed` notification. Only
//! validation, lookup, configuration and persistence errors escape to
//! callers.

use std::fmt;

use herald_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error conditions raised while accepting or delivering notifications.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Request failed validation.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong with the request
        message: String,
    },

    /// Requested entity does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Which entity was missing
        message: String,
    },

    /// Channel provider rejected the notification.
    #[error("{channel} provider error: {message}")]
    Provider {
        /// Adapter name
        channel: String,
        /// Provider-specific error code, when one was returned
        code: Option<String>,
        /// Provider response or reason
        message: String,
    },

    /// Could not reach the provider.
    #[error("network error: {message}")]
    Network {
        /// Transport error description
        message: String,
    },

    /// Provider did not answer in time.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Circuit breaker rejected the call without invoking the adapter.
    #[error("circuit breaker open for channel {channel}")]
    CircuitOpen {
        /// Adapter name guarded by the breaker
        channel: String,
    },

    /// Missing or invalid setup, such as an unregistered channel.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Storage layer failed.
    #[error("persistence error: {message}")]
    Persistence {
        /// Storage error message
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DispatchError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a provider error.
    pub fn provider(
        channel: impl Into<String>,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider { channel: channel.into(), code, message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(channel: impl Into<String>) -> Self {
        Self::CircuitOpen { channel: channel.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether this error belongs to a delivery attempt rather than the
    /// request or the infrastructure.
    ///
    /// Delivery errors are recorded on the notification; the rest propagate.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
        )
    }

    /// Stable error code exposed over the API.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "E1001",
            Self::NotFound { .. } => "E1002",
            Self::Provider { .. } => "E2001",
            Self::CircuitOpen { .. } => "E2002",
            Self::Network { .. } | Self::Timeout { .. } => "E2003",
            Self::Configuration { .. } => "E3001",
            Self::Persistence { .. } => "E3002",
            Self::Internal { .. } => "E3003",
        }
    }
}

impl From<CoreError> for DispatchError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::Validation { message },
            CoreError::NotFound(message) => Self::NotFound { message },
            other => Self::Persistence { message: other.to_string() },
        }
    }
}

/// Category of dispatch error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied bad input.
    Validation,
    /// Entity lookup failed.
    NotFound,
    /// Provider rejected the message.
    Provider,
    /// Transport or timeout.
    Network,
    /// Circuit breaker protection.
    Circuit,
    /// Configuration problems.
    Configuration,
    /// Storage failures.
    Persistence,
    /// Internal system errors.
    Internal,
}

impl From<&DispatchError> for ErrorCategory {
    fn from(error: &DispatchError) -> Self {
        match error {
            DispatchError::Validation { .. } => Self::Validation,
            DispatchError::NotFound { .. } => Self::NotFound,
            DispatchError::Provider { .. } => Self::Provider,
            DispatchError::Network { .. } | DispatchError::Timeout { .. } => Self::Network,
            DispatchError::CircuitOpen { .. } => Self::Circuit,
            DispatchError::Configuration { .. } => Self::Configuration,
            DispatchError::Persistence { .. } => Self::Persistence,
            DispatchError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Provider => write!(f, "provider"),
            Self::Network => write!(f, "network"),
            Self::Circuit => write!(f, "circuit"),
            Self::Configuration => write!(f, "configuration"),
            Self::Persistence => write!(f, "persistence"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
