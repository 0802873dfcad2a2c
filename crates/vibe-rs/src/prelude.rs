//! Convenience re-exports for common `vibe-rs` types.
//!
//! ```ignore
//! use vibe_rs::prelude::*;
//! ```
//!
//! Covers the context window, messages, plugins, configuration, sessions and
//! the turn driver. Estimator and eviction internals, snapshot records and
//! retry tuning stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    AgentError, ConfigError, ContextError, Message, MessageRole, PluginError, SessionError,
    json_schema_for,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{ContextUsage, ContextWindow, UsageLevel, WindowSnapshot};

// ── Plugins ─────────────────────────────────────────────────────────
pub use crate::plugins::{Calculator, Plugin, PluginCatalog, PluginFuture, PluginRegistry};

// ── Agents and sessions ─────────────────────────────────────────────
pub use crate::agent::{
    AgentFactory, ChatAgent, ChatBackend, ConversationAgent, EchoBackend, ReplyCache,
    TokenUsage, TurnOutcome,
};
pub use crate::config::AgentConfig;
pub use crate::session::{SessionHandle, SessionRegistry, SessionStore};
