//! The context window: an ordered conversation bounded by a token budget.
//!
//! Messages live in two groups:
//!
//! 1. **Pinned**: system instructions and the compaction summary. Never
//!    evicted, always emitted first.
//! 2. **History**: every other message, oldest first. Evicted strictly
//!    oldest-first whenever the history no longer fits in
//!    `budget - pinned cost`.
//!
//! Eviction runs right after every mutation, so the stored history always
//! satisfies the budget unless the window is in the overflow state: the
//! newest message alone is larger than the allowance. That message is kept
//! whole and the overflow is reported to the caller instead.

use super::budget::{ContextUsage, UsageLevel};
use super::estimator::{CharRatioEstimator, TokenEstimator};
use super::eviction::{EvictionPolicy, OldestFirst, effective_allowance};
use super::snapshot::WindowSnapshot;
use crate::{ContextError, Message, MessageRole};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

/// Default token budget for a window.
pub const DEFAULT_BUDGET: usize = 4_000;

/// Prefix of the pinned message produced by [`ContextWindow::compact`].
pub const SUMMARY_PREFIX: &str = "Summary of earlier conversation: ";

/// Metadata key marking a compaction summary.
pub const SUMMARY_META_KEY: &str = "summary";

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    cost: usize,
}

/// What a mutation did to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    /// Messages evicted by the pass that followed the mutation.
    pub evicted: usize,
    /// The window is now in the overflow state.
    pub overflow: bool,
}

/// Token-budgeted conversation window.
///
/// # Example
///
/// ```
/// use vibe_rs::context::ContextWindow;
/// use vibe_rs::Message;
///
/// let mut window = ContextWindow::new(2_000).with_system_prompt("Be brief.");
/// let outcome = window.append(Message::user("hello")).unwrap();
/// assert_eq!(outcome.evicted, 0);
///
/// let context = window.retrieve(2_000).unwrap();
/// assert_eq!(context[0].content(), "Be brief.");
/// assert_eq!(context[1].content(), "hello");
/// ```
pub struct ContextWindow {
    pinned: Vec<Entry>,
    history: VecDeque<Entry>,
    budget: usize,
    /// Whether appended `system` messages are pinned.
    pin_system: bool,
    /// Optional cap on the number of history messages.
    max_messages: Option<usize>,
    estimator: Box<dyn TokenEstimator>,
    policy: Box<dyn EvictionPolicy>,
    overflow: bool,
    evicted_total: usize,
}

impl fmt::Debug for ContextWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWindow")
            .field("budget", &self.budget)
            .field("pinned", &self.pinned.len())
            .field("history", &self.history.len())
            .field("pin_system", &self.pin_system)
            .field("max_messages", &self.max_messages)
            .field("overflow", &self.overflow)
            .finish()
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET)
    }
}

impl ContextWindow {
    /// Create an empty window with the given token budget.
    pub fn new(budget: usize) -> Self {
        Self {
            pinned: Vec::new(),
            history: VecDeque::new(),
            budget,
            pin_system: true,
            max_messages: None,
            estimator: Box::new(CharRatioEstimator::default()),
            policy: Box::new(OldestFirst),
            overflow: false,
            evicted_total: 0,
        }
    }

    /// Seed the window with a pinned system message. Blank prompts are ignored.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let message = Message::system(prompt);
        if message.validate().is_ok() {
            let cost = self.estimator.message_cost(&message);
            self.pinned.push(Entry { message, cost });
            self.enforce();
        } else {
            debug!("Ignoring blank system prompt");
        }
        self
    }

    /// Replace the token estimator. Costs of stored messages are recomputed
    /// and the budget is re-enforced.
    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        for entry in self.pinned.iter_mut().chain(self.history.iter_mut()) {
            entry.cost = self.estimator.message_cost(&entry.message);
        }
        self.enforce();
        self
    }

    /// Replace the eviction policy.
    pub fn with_policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self.enforce();
        self
    }

    /// Whether appended `system` messages are pinned (default `true`). A
    /// prompt seeded through [`with_system_prompt`](Self::with_system_prompt)
    /// is pinned either way.
    pub fn with_pin_system(mut self, pin: bool) -> Self {
        self.pin_system = pin;
        self
    }

    /// Cap the number of history messages (in addition to the token budget).
    /// A cap of zero is treated as one: the newest message is always kept.
    pub fn with_max_messages(mut self, max: Option<usize>) -> Self {
        self.max_messages = max;
        self.enforce();
        self
    }

    // ── Core operations ────────────────────────────────────────────

    /// Append a message and run an eviction pass.
    ///
    /// Fails only for malformed messages; capacity is handled by eviction,
    /// never by rejection.
    pub fn append(&mut self, message: Message) -> Result<AppendOutcome, ContextError> {
        message.validate()?;

        let cost = self.estimator.message_cost(&message);
        let role = message.role();
        let pinned = self.pin_system && role == MessageRole::System;
        if pinned {
            self.pinned.push(Entry { message, cost });
        } else {
            self.history.push_back(Entry { message, cost });
        }

        let outcome = self.enforce();
        debug!(
            %role,
            cost,
            pinned,
            evicted = outcome.evicted,
            history = self.history.len(),
            "Message appended"
        );

        let usage = self.usage();
        if outcome.overflow {
            warn!(
                "Context overflow: newest message kept whole, {}",
                usage.to_log_string()
            );
        } else if usage.level() == UsageLevel::Critical {
            warn!("Context near budget: {}", usage.to_log_string());
        }

        Ok(outcome)
    }

    /// Ordered context that fits in `max_tokens`: pinned messages first,
    /// then surviving history in chronological order.
    ///
    /// Does not mutate the window. A `max_tokens` smaller than the stored
    /// budget trims the returned view only. Returns
    /// [`ContextError::Overflow`] when the pinned messages plus the newest
    /// history message do not fit; callers can fall back to
    /// [`pinned`](Self::pinned) or abort.
    pub fn retrieve(&self, max_tokens: usize) -> Result<Vec<Message>, ContextError> {
        let costs = self.history_costs();
        let pinned_cost = self.pinned_cost();
        let retention = self
            .policy
            .retain(&costs, effective_allowance(max_tokens, pinned_cost));

        let total = pinned_cost + retention.retained_cost;
        if total > max_tokens {
            return Err(ContextError::Overflow {
                required: total,
                limit: max_tokens,
            });
        }

        let mut out = Vec::with_capacity(self.pinned.len() + costs.len() - retention.keep_from);
        out.extend(self.pinned.iter().map(|e| e.message.clone()));
        out.extend(
            self.history
                .iter()
                .skip(retention.keep_from)
                .map(|e| e.message.clone()),
        );
        Ok(out)
    }

    /// Drop all history and any compaction summary. Other pinned messages
    /// survive. Calling it again is a no-op.
    pub fn reset(&mut self) {
        let cleared = self.history.len();
        self.history.clear();
        self.pinned.retain(|e| !is_summary(&e.message));
        self.overflow = self.pinned_cost() > self.budget;
        if cleared > 0 {
            info!(cleared, "Context history reset");
        }
    }

    // ── Additional operations ──────────────────────────────────────

    /// Change the budget and re-run eviction against it.
    pub fn set_budget(&mut self, budget: usize) -> AppendOutcome {
        self.budget = budget;
        self.enforce()
    }

    /// Replace the whole history with a pinned summary.
    ///
    /// `summarizer` receives the history oldest first and returns the summary
    /// text. A previous summary is replaced, not stacked. Returns the summary.
    pub fn compact<F>(&mut self, summarizer: F) -> Result<String, ContextError>
    where
        F: FnOnce(&[Message]) -> String,
    {
        if self.history.is_empty() {
            return Err(ContextError::NothingToCompact);
        }

        let messages: Vec<Message> = self.history.iter().map(|e| e.message.clone()).collect();
        let summary = summarizer(&messages);

        let message = Message::system(format!("{SUMMARY_PREFIX}{summary}"))
            .with_metadata(SUMMARY_META_KEY, serde_json::Value::Bool(true));
        let cost = self.estimator.message_cost(&message);

        self.history.clear();
        self.pinned.retain(|e| !is_summary(&e.message));
        self.pinned.push(Entry { message, cost });
        self.enforce();

        info!(
            summarized = messages.len(),
            summary_len = summary.len(),
            "Context compacted"
        );
        Ok(summary)
    }

    /// Capture the window's messages and settings for external persistence.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            budget: self.budget,
            pin_system: self.pin_system,
            max_messages: self.max_messages,
            pinned: self.pinned.iter().map(|e| e.message.clone()).collect(),
            history: self.history.iter().map(|e| e.message.clone()).collect(),
        }
    }

    /// Rebuild a window from a snapshot. Every message is re-validated and
    /// the budget is re-enforced. Uses the default estimator and policy;
    /// chain [`with_estimator`](Self::with_estimator) to change them.
    pub fn restore(snapshot: WindowSnapshot) -> Result<Self, ContextError> {
        let mut window = Self::new(snapshot.budget).with_pin_system(snapshot.pin_system);
        window.max_messages = snapshot.max_messages;

        for message in snapshot.pinned {
            message.validate()?;
            let cost = window.estimator.message_cost(&message);
            window.pinned.push(Entry { message, cost });
        }
        for message in snapshot.history {
            message.validate()?;
            let cost = window.estimator.message_cost(&message);
            window.history.push_back(Entry { message, cost });
        }

        let outcome = window.enforce();
        debug!(
            pinned = window.pinned.len(),
            history = window.history.len(),
            evicted = outcome.evicted,
            "Context window restored"
        );
        Ok(window)
    }

    /// Serialize the window (see [`snapshot`](Self::snapshot)) to JSON.
    pub fn to_json(&self) -> Result<String, ContextError> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Rebuild a window from JSON produced by [`to_json`](Self::to_json).
    pub fn from_json(json: &str) -> Result<Self, ContextError> {
        Self::restore(WindowSnapshot::from_json(json)?)
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn pin_system(&self) -> bool {
        self.pin_system
    }

    pub fn max_messages(&self) -> Option<usize> {
        self.max_messages
    }

    /// Pinned messages, in insertion order.
    pub fn pinned(&self) -> impl Iterator<Item = &Message> {
        self.pinned.iter().map(|e| &e.message)
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.history.iter().map(|e| &e.message)
    }

    /// Every stored message: pinned first, then history.
    pub fn messages(&self) -> Vec<Message> {
        self.pinned().chain(self.history()).cloned().collect()
    }

    /// The current compaction summary, if any.
    pub fn summary(&self) -> Option<&Message> {
        self.pinned().find(|m| is_summary(m))
    }

    /// Total number of stored messages.
    pub fn len(&self) -> usize {
        self.pinned.len() + self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty() && self.history.is_empty()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn pinned_cost(&self) -> usize {
        self.pinned.iter().map(|e| e.cost).sum()
    }

    pub fn history_cost(&self) -> usize {
        self.history.iter().map(|e| e.cost).sum()
    }

    /// Estimated tokens of everything stored.
    pub fn total_tokens(&self) -> usize {
        self.pinned_cost() + self.history_cost()
    }

    pub fn usage(&self) -> ContextUsage {
        ContextUsage::new(self.total_tokens(), self.budget)
    }

    /// Whether the last mutation left the window over budget.
    pub fn is_overflowing(&self) -> bool {
        self.overflow
    }

    /// Messages evicted over the window's lifetime.
    pub fn evicted_total(&self) -> usize {
        self.evicted_total
    }

    /// Estimated cost of a message under this window's estimator.
    pub fn cost_of(&self, message: &Message) -> usize {
        self.estimator.message_cost(message)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn history_costs(&self) -> Vec<usize> {
        self.history.iter().map(|e| e.cost).collect()
    }

    /// Apply the message cap and the eviction policy to the stored history.
    fn enforce(&mut self) -> AppendOutcome {
        let mut evicted = 0;

        if let Some(max) = self.max_messages {
            let max = max.max(1);
            while self.history.len() > max {
                self.history.pop_front();
                evicted += 1;
            }
        }

        let pinned_cost = self.pinned_cost();
        let retention = self.policy.retain(
            &self.history_costs(),
            effective_allowance(self.budget, pinned_cost),
        );
        self.history.drain(..retention.keep_from);
        evicted += retention.evicted();

        self.overflow = pinned_cost + retention.retained_cost > self.budget;
        self.evicted_total += evicted;

        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.history.len(),
                budget = self.budget,
                "Evicted oldest history"
            );
        }

        AppendOutcome {
            evicted,
            overflow: self.overflow,
        }
    }
}

fn is_summary(message: &Message) -> bool {
    message
        .meta(SUMMARY_META_KEY)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}
