//! Error types for every layer of the crate.
//!
//! Each subsystem has its own enum so callers can match on exactly what
//! went wrong; [`AgentError`] wraps them all for the turn driver.

use thiserror::Error;

/// Errors raised by the context window.
#[derive(Error, Debug)]
pub enum ContextError {
    /// Pinned messages plus the latest turn do not fit in the limit.
    #[error("context overflow: minimal context needs {required} tokens but the limit is {limit}")]
    Overflow { required: usize, limit: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("no conversation history to compact")]
    NothingToCompact,

    #[error("malformed window snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Errors raised by the plugin registry and plugin implementations.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// A configured plugin name has no entry in the catalog.
    #[error("unknown plugin '{0}' (not in the plugin catalog)")]
    Unknown(String),

    #[error("plugin is disabled: {0}")]
    Disabled(String),

    #[error("failed to register plugin '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error("invalid arguments for plugin '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("plugin '{name}' failed: {reason}")]
    Execution { name: String, reason: String },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Session lookup and persistence errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session expired: {0}")]
    Expired(String),

    /// A lifetime that cannot be represented as an expiry time.
    #[error("invalid session lifetime: {0}")]
    InvalidTtl(String),

    #[error("session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session data is malformed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Failure reported by a chat backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Whether the failure is worth retrying (rate limits, timeouts, 5xx).
    pub transient: bool,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Umbrella error for a conversation turn.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("chat backend failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: BackendError,
    },
}
