//! Conversational agent toolkit built around a token-budgeted context window.
//!
//! `vibe-rs` keeps the part of a chat agent that lives *between* the user and
//! the model: the conversation history, the token budget it has to fit in,
//! the capabilities (plugins) the model may call, and the per-session state
//! that survives between turns. The LLM itself sits behind the
//! [`ChatBackend`](agent::backend::ChatBackend) trait.
//!
//! # Getting started
//!
//! ```
//! use vibe_rs::prelude::*;
//!
//! let mut window = ContextWindow::new(4_000).with_system_prompt("You are a helpful assistant.");
//! window.append(Message::user("What is 2 + 2?")).unwrap();
//! window.append(Message::assistant("4.")).unwrap();
//!
//! let context = window.retrieve(window.budget()).unwrap();
//! assert_eq!(context.len(), 3);
//! assert_eq!(context[0].role(), MessageRole::System);
//! ```
//!
//! # Where to find things
//!
//! - **Bounding history to a token budget:** [`ContextWindow`](context::ContextWindow),
//!   with pluggable [`TokenEstimator`](context::TokenEstimator) and
//!   [`EvictionPolicy`](context::EvictionPolicy) implementations.
//! - **Capabilities the model can call:** the [`Plugin`](plugins::Plugin) trait and
//!   [`PluginRegistry`](plugins::PluginRegistry). The built-in
//!   [`Calculator`](plugins::calculator::Calculator) is a safe expression evaluator.
//! - **Configuration:** [`AgentConfig`](config::AgentConfig), loadable from the
//!   environment.
//! - **Running turns:** [`ConversationAgent`](agent::ConversationAgent) drives
//!   append → retrieve → backend → append under a per-session lock held by the
//!   [`SessionRegistry`](session::SessionRegistry).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token estimation, eviction, usage reporting, the context window and its snapshots |
//! | [`plugins`] | Plugin trait, registry, static catalog, calculator |
//! | [`agent`] | Agent factory/cache, chat backend seam, retry, turn driver |
//! | [`session`] | Session state, TTL expiry, per-session locking, JSON store |
//! | [`config`] | Agent configuration and validation |
//! | [`error`] | Error types for every layer |

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod plugins;
pub mod prelude;
pub mod session;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use error::{AgentError, BackendError, ConfigError, ContextError, PluginError, SessionError};

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Used by plugins to describe their arguments in
/// the function-calling format.
///
/// ```
/// use vibe_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct LookupArgs {
///     city: String,
/// }
///
/// let schema = json_schema_for::<LookupArgs>();
/// assert_eq!(schema["type"], "object");
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conversation message.
///
/// Messages are immutable once built: fields are only reachable through
/// accessors, and metadata can only be attached with [`Message::with_metadata`]
/// while the value is still being constructed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    role: MessageRole,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Attach a metadata entry (builder style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Override the creation timestamp (builder style). Used when replaying
    /// stored conversations.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn role(&self) -> MessageRole {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Look up a single metadata value.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Check that the message carries usable content.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.content.trim().is_empty() {
            return Err(ContextError::InvalidMessage(format!(
                "{} message has empty content",
                self.role
            )));
        }
        Ok(())
    }
}
