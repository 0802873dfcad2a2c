//! The turn driver: one user message in, one assistant reply out.
//!
//! A turn runs entirely under the session lock:
//!
//! 1. append the user message (evicting old history if needed)
//! 2. retrieve the context at the window budget
//! 3. call the backend, retrying transient failures
//! 4. append the assistant reply and persist the session
//!
//! If retrieval overflows, the turn fails with the [`ContextError`] and the
//! user message stays in the window. If the backend fails, the user message
//! also stays; nothing is appended for the assistant.
//!
//! [`ConversationAgent::chat_stream`] runs the same turn but hands reply
//! chunks to a callback as the backend produces them. Replies are cached by
//! a fingerprint of the context (see [`ReplyCache`]), so a repeated context
//! skips the backend entirely.

use super::backend::{ChatBackend, CompletionSettings};
use super::cache::ReplyCache;
use super::factory::ChatAgent;
use super::retry::RetryConfig;
use crate::context::{ContextUsage, ContextWindow};
use crate::plugins::PluginRegistry;
use crate::session::SessionRegistry;
use crate::{AgentError, BackendError, ContextError, Message};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Estimated tokens sent to and received from the backend.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Counters over the lifetime of a [`ConversationAgent`].
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ConversationMetrics {
    /// Completed turns.
    pub turns: u64,
    /// Turns that ended in an error.
    pub failures: u64,
    pub plugin_calls: u64,
    /// Turns answered from the reply cache.
    pub cache_hits: u64,
    /// Messages evicted from windows by this agent's turns.
    pub evicted_messages: u64,
    /// Backend token usage, estimated with each window's estimator. Cached
    /// replies do not count.
    pub token_usage: TokenUsage,
    pub total_response_time: Duration,
    pub average_response_time: Duration,
}

/// Result of a successful turn.
#[derive(Serialize, Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    /// Window usage after the reply was appended.
    pub usage: ContextUsage,
    /// Messages evicted during this turn.
    pub evicted: usize,
    /// The window is over budget after the reply was appended; the next
    /// turn will fail to retrieve unless older messages can be evicted.
    pub overflow: bool,
    /// Backend attempts used; 0 when the reply came from the cache.
    pub attempts: u32,
    pub cached: bool,
    /// Estimated tokens for this turn; zero when cached.
    pub tokens: TokenUsage,
}

/// Reply produced by the backend or the cache for one turn.
struct Generated {
    reply: String,
    attempts: u32,
    cached: bool,
}

/// Drives conversation turns for one agent over a set of sessions.
pub struct ConversationAgent {
    agent: Arc<ChatAgent>,
    backend: Arc<dyn ChatBackend>,
    sessions: Arc<SessionRegistry>,
    plugins: PluginRegistry,
    retry: RetryConfig,
    cache: ReplyCache,
    metrics: Mutex<ConversationMetrics>,
}

impl fmt::Debug for ConversationAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationAgent")
            .field("agent", &self.agent.name())
            .field("backend", &self.backend.name())
            .field("plugins", &self.plugins)
            .field("retry", &self.retry)
            .field("cache", &self.cache)
            .finish()
    }
}

impl ConversationAgent {
    /// Retries follow the agent's `max_retries`. The reply cache holds
    /// [`DEFAULT_CACHE_CAPACITY`](super::cache::DEFAULT_CACHE_CAPACITY)
    /// entries.
    pub fn new(
        agent: Arc<ChatAgent>,
        backend: impl ChatBackend + 'static,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        let retry = RetryConfig::with_attempts(agent.config().max_retries);
        Self {
            agent,
            backend: Arc::new(backend),
            sessions,
            plugins: PluginRegistry::new(),
            retry,
            cache: ReplyCache::default(),
            metrics: Mutex::new(ConversationMetrics::default()),
        }
    }

    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the reply cache; `ReplyCache::disabled()` turns caching off.
    pub fn with_cache(mut self, cache: ReplyCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn agent(&self) -> &ChatAgent {
        &self.agent
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn cache(&self) -> &ReplyCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// A copy of the current metrics.
    pub fn metrics(&self) -> ConversationMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one turn on a session.
    pub async fn chat(&self, session_id: &str, text: &str) -> Result<TurnOutcome, AgentError> {
        let start = Instant::now();
        let result = self.run_turn(session_id, text, None).await;
        self.record(session_id, start, &result);
        result
    }

    /// Run one turn, invoking `on_chunk` with each piece of the reply as the
    /// backend streams it. Failures before the first chunk are retried; once
    /// a chunk has been delivered, a failure ends the turn. A cached reply
    /// arrives as a single chunk.
    pub async fn chat_stream(
        &self,
        session_id: &str,
        text: &str,
        mut on_chunk: impl FnMut(&str) + Send,
    ) -> Result<TurnOutcome, AgentError> {
        let start = Instant::now();
        let on_chunk: &mut (dyn FnMut(&str) + Send) = &mut on_chunk;
        let result = self.run_turn(session_id, text, Some(on_chunk)).await;
        self.record(session_id, start, &result);
        result
    }

    fn record(
        &self,
        session_id: &str,
        start: Instant,
        result: &Result<TurnOutcome, AgentError>,
    ) {
        let elapsed = start.elapsed();
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(outcome) => {
                metrics.turns += 1;
                metrics.evicted_messages += outcome.evicted as u64;
                metrics.token_usage.add(outcome.tokens);
                if outcome.cached {
                    metrics.cache_hits += 1;
                }
                metrics.total_response_time += elapsed;
                let turns = u32::try_from(metrics.turns).unwrap_or(u32::MAX);
                metrics.average_response_time = metrics.total_response_time / turns;
                info!(
                    session = session_id,
                    attempts = outcome.attempts,
                    cached = outcome.cached,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Turn completed, {}",
                    outcome.usage.to_log_string()
                );
            }
            Err(e) => {
                metrics.failures += 1;
                warn!(session = session_id, "Turn failed: {e}");
            }
        }
    }

    async fn run_turn(
        &self,
        session_id: &str,
        text: &str,
        on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<TurnOutcome, AgentError> {
        self.check_input(text)?;

        let handle = self.sessions.get(session_id).await?;
        let mut session = handle.lock().await;

        let appended = session.window.append(Message::user(text))?;
        let budget = session.window.budget();
        let context = match session.window.retrieve(budget) {
            Ok(context) => context,
            Err(e) => {
                session.touch();
                self.sessions.persist(&session)?;
                return Err(e.into());
            }
        };
        debug!(
            session = session_id,
            messages = context.len(),
            "Sending context to {}",
            self.backend.name()
        );

        let generated = self.generate(&context, on_chunk).await?;
        let reply = Message::assistant(generated.reply.clone());
        let tokens = if generated.cached {
            TokenUsage::default()
        } else {
            estimate_usage(&session.window, &context, &reply)
        };

        let answered = session.window.append(reply)?;
        if answered.overflow {
            warn!(
                session = session_id,
                "Reply left the window over budget, {}",
                session.window.usage().to_log_string()
            );
        }
        session.touch();
        self.sessions.persist(&session)?;

        Ok(TurnOutcome {
            reply: generated.reply,
            usage: session.window.usage(),
            evicted: appended.evicted + answered.evicted,
            overflow: answered.overflow,
            attempts: generated.attempts,
            cached: generated.cached,
            tokens,
        })
    }

    /// Answer from the cache, or call the backend and cache the reply.
    async fn generate(
        &self,
        context: &[Message],
        on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<Generated, AgentError> {
        let settings = self.agent.settings();
        let key = self
            .cache
            .is_enabled()
            .then(|| ReplyCache::key(context, settings));

        if let Some(reply) = key.as_deref().and_then(|k| self.cache.get(k)) {
            debug!("Answering from the reply cache");
            if let Some(on_chunk) = on_chunk {
                on_chunk(&reply);
            }
            return Ok(Generated {
                reply,
                attempts: 0,
                cached: true,
            });
        }

        let (reply, attempts) = match on_chunk {
            Some(on_chunk) => self.complete_streaming(context, on_chunk).await?,
            None => self.complete(context).await?,
        };
        if let Some(key) = key {
            self.cache.insert(key, reply.clone());
        }
        Ok(Generated {
            reply,
            attempts,
            cached: false,
        })
    }

    fn check_input(&self, text: &str) -> Result<(), ContextError> {
        if text.trim().is_empty() {
            return Err(ContextError::InvalidMessage("message is empty".into()));
        }
        let max = self.agent.config().max_message_length;
        let len = text.chars().count();
        if len > max {
            return Err(ContextError::InvalidMessage(format!(
                "message is {len} characters; the limit is {max}"
            )));
        }
        Ok(())
    }

    /// Call the backend with retry and the configured timeout.
    async fn complete(&self, context: &[Message]) -> Result<(String, u32), AgentError> {
        let backend: &dyn ChatBackend = self.backend.as_ref();
        let settings: &CompletionSettings = self.agent.settings();
        let timeout = settings.timeout;

        self.retry
            .run(move |attempt| async move {
                let reply = tokio::time::timeout(timeout, backend.complete(context, settings))
                    .await
                    .map_err(|_| {
                        BackendError::transient(format!(
                            "request timed out after {}s",
                            timeout.as_secs()
                        ))
                    })??;
                if reply.trim().is_empty() {
                    return Err(BackendError::permanent("backend returned an empty reply"));
                }
                Ok((reply, attempt))
            })
            .await
    }

    /// Streaming counterpart of [`complete`](Self::complete). Retries follow
    /// the same schedule, but only while no chunk has been delivered.
    async fn complete_streaming(
        &self,
        context: &[Message],
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(String, u32), AgentError> {
        let backend: &dyn ChatBackend = self.backend.as_ref();
        let settings: &CompletionSettings = self.agent.settings();
        let timeout = settings.timeout;
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let mut reply = String::new();
            let result = tokio::time::timeout(timeout, async {
                let mut chunks = backend.complete_stream(context, settings);
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    on_chunk(&chunk);
                    reply.push_str(&chunk);
                }
                Ok::<(), BackendError>(())
            })
            .await;

            let streamed = match result {
                Err(_) => Err(BackendError::transient(format!(
                    "request timed out after {}s",
                    timeout.as_secs()
                ))),
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) if reply.trim().is_empty() => {
                    Err(BackendError::permanent("backend returned an empty reply"))
                }
                Ok(Ok(())) => Ok(()),
            };

            match streamed {
                Ok(()) => return Ok((reply, attempt)),
                Err(e) if e.transient && attempt < max_attempts && reply.is_empty() => {
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        "Streaming attempt {attempt}/{max_attempts} failed: {e}; retrying in {:.0}ms",
                        delay.as_secs_f64() * 1000.0
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(source) => {
                    return Err(AgentError::Backend {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// Run a plugin on behalf of a session and record its latest result in
    /// the session's plugin data.
    pub async fn invoke_plugin(
        &self,
        session_id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let handle = self.sessions.get(session_id).await?;
        let mut session = handle.lock().await;

        let output = self.plugins.execute(name, args).await?;
        session
            .plugin_data
            .insert(name.to_string(), output.clone());
        session.touch();
        self.sessions.persist(&session)?;

        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .plugin_calls += 1;
        Ok(output)
    }

    /// Clear a session's history and summary, keeping its instructions.
    pub async fn reset(&self, session_id: &str) -> Result<(), AgentError> {
        let handle = self.sessions.get(session_id).await?;
        let mut session = handle.lock().await;
        session.window.reset();
        session.touch();
        self.sessions.persist(&session)?;
        Ok(())
    }
}

/// Prompt tokens are the retrieved context, completion tokens the reply,
/// both costed by the session window's estimator.
fn estimate_usage(window: &ContextWindow, context: &[Message], reply: &Message) -> TokenUsage {
    let prompt: usize = context.iter().map(|m| window.cost_of(m)).sum();
    TokenUsage::new(prompt as u64, window.cost_of(reply) as u64)
}
