//! Agents: construction, the chat backend seam, and the turn driver.
//!
//! - **[`factory`]**: [`AgentFactory`] builds and caches [`ChatAgent`]s by
//!   config fingerprint.
//! - **[`backend`]**: [`ChatBackend`], the trait a model client implements.
//! - **[`retry`]**: backoff for transient backend failures.
//! - **[`cache`]**: [`ReplyCache`], replies keyed by context fingerprint.
//! - **[`conversation`]**: [`ConversationAgent`] runs a turn under the
//!   session lock.

pub mod backend;
pub mod cache;
pub mod conversation;
pub mod factory;
pub mod retry;

pub use backend::{
    ChatBackend, CompletionFuture, CompletionSettings, CompletionStream, EchoBackend,
};
pub use cache::{DEFAULT_CACHE_CAPACITY, ReplyCache};
pub use conversation::{ConversationAgent, ConversationMetrics, TokenUsage, TurnOutcome};
pub use factory::{AgentFactory, ChatAgent, DEFAULT_INSTRUCTIONS};
pub use retry::RetryConfig;
