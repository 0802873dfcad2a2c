//! Context window management: token estimation, eviction, and the window itself.
//!
//! The context window is the scarcest resource of a chat agent. This module
//! keeps the conversation inside a token budget:
//!
//! 1. **[`estimator`]**: [`TokenEstimator`] maps a message to an approximate,
//!    deterministic token cost. [`CharRatioEstimator`] is the default.
//!
//! 2. **[`eviction`]**: [`EvictionPolicy`] decides which history survives a
//!    budget. [`OldestFirst`] evicts strictly oldest-first and never drops
//!    the newest message.
//!
//! 3. **[`window`]**: [`ContextWindow`] owns the message sequence: pinned
//!    messages (system instructions, compaction summary) that are never
//!    evicted, followed by history bounded by `budget - pinned cost`.
//!
//! 4. **[`budget`]**: [`ContextUsage`] reports how close a window is to its
//!    budget; [`snapshot`] carries windows to and from JSON.

pub mod budget;
pub mod estimator;
pub mod eviction;
pub mod snapshot;
pub mod window;

// Re-export commonly used items at the module level.
pub use budget::{ContextUsage, UsageLevel};
pub use estimator::{
    CharRatioEstimator, DEFAULT_CHARS_PER_TOKEN, MESSAGE_OVERHEAD_TOKENS, TokenEstimator,
};
pub use eviction::{EvictionPolicy, OldestFirst, Retention, effective_allowance};
pub use snapshot::{MessageRecord, WindowSnapshot, parse_messages};
pub use window::{AppendOutcome, ContextWindow, DEFAULT_BUDGET, SUMMARY_PREFIX};
