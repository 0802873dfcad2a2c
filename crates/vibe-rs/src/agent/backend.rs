//! Chat backend seam.
//!
//! The turn driver hands the retrieved context to a [`ChatBackend`] and gets
//! the assistant's reply back, either whole through
//! [`complete`](ChatBackend::complete) or as a chunk stream through
//! [`complete_stream`](ChatBackend::complete_stream). No network client
//! ships with this crate; [`EchoBackend`] answers offline.

use crate::config::AgentConfig;
use crate::{BackendError, Message, MessageRole};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use serde::Serialize;
use std::time::Duration;

/// Boxed future returned by [`ChatBackend::complete`].
pub type CompletionFuture<'a> = BoxFuture<'a, Result<String, BackendError>>;

/// Reply chunks returned by [`ChatBackend::complete_stream`]. Concatenated,
/// the chunks form the whole reply.
pub type CompletionStream<'a> = BoxStream<'a, Result<String, BackendError>>;

/// Per-request model settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Upper bound for a single backend call.
    pub timeout: Duration,
}

impl From<&AgentConfig> for CompletionSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Something that turns a conversation into an assistant reply.
pub trait ChatBackend: Send + Sync {
    /// Produce the next assistant message for `messages`.
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        settings: &'a CompletionSettings,
    ) -> CompletionFuture<'a>;

    /// Produce the reply as a stream of chunks. The default yields the whole
    /// [`complete`](Self::complete) result as a single chunk.
    fn complete_stream<'a>(
        &'a self,
        messages: &'a [Message],
        settings: &'a CompletionSettings,
    ) -> CompletionStream<'a> {
        Box::pin(self.complete(messages, settings).into_stream())
    }

    /// Short identifier used in logs.
    fn name(&self) -> &str {
        "backend"
    }
}

/// Replies with the latest user message, prefixed. Used by the CLI and tests.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    prefix: String,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoBackend {
    pub fn new() -> Self {
        Self {
            prefix: "echo: ".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn reply_to(&self, messages: &[Message]) -> Result<String, BackendError> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role() == MessageRole::User)
            .ok_or_else(|| BackendError::permanent("no user message in context"))?;
        Ok(format!("{}{}", self.prefix, last.content()))
    }
}

impl ChatBackend for EchoBackend {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        _settings: &'a CompletionSettings,
    ) -> CompletionFuture<'a> {
        Box::pin(async move { self.reply_to(messages) })
    }

    /// Streams the reply one word (with its trailing whitespace) at a time.
    fn complete_stream<'a>(
        &'a self,
        messages: &'a [Message],
        _settings: &'a CompletionSettings,
    ) -> CompletionStream<'a> {
        let chunks: Vec<Result<String, BackendError>> = match self.reply_to(messages) {
            Ok(reply) => reply.split_inclusive(' ').map(|w| Ok(w.to_string())).collect(),
            Err(e) => vec![Err(e)],
        };
        Box::pin(stream::iter(chunks))
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn echo_repeats_latest_user_message() {
        let backend = EchoBackend::new();
        let settings = CompletionSettings::from(&AgentConfig::default());
        let messages = vec![
            Message::system("rules"),
            Message::user("first"),
            Message::assistant("echo: first"),
            Message::user("second"),
        ];
        let reply = backend.complete(&messages, &settings).await.unwrap();
        assert_eq!(reply, "echo: second");
    }

    #[tokio::test]
    async fn echo_without_user_message_fails_permanently() {
        let backend = EchoBackend::new().with_prefix("> ");
        let settings = CompletionSettings::from(&AgentConfig::default());
        let err = backend
            .complete(&[Message::system("rules")], &settings)
            .await
            .unwrap_err();
        assert!(!err.transient);
    }

    #[tokio::test]
    async fn echo_streams_word_chunks() {
        let backend = EchoBackend::new();
        let settings = CompletionSettings::from(&AgentConfig::default());
        let messages = vec![Message::user("one two three")];
        let chunks: Vec<String> = backend
            .complete_stream(&messages, &settings)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["echo: ", "one ", "two ", "three"]);
    }

    /// Implements only `complete`, so streaming falls back to one chunk.
    struct Whole;

    impl ChatBackend for Whole {
        fn complete<'a>(
            &'a self,
            _messages: &'a [Message],
            _settings: &'a CompletionSettings,
        ) -> CompletionFuture<'a> {
            Box::pin(async { Ok("all at once".to_string()) })
        }
    }

    #[tokio::test]
    async fn default_stream_yields_the_whole_reply() {
        let settings = CompletionSettings::from(&AgentConfig::default());
        let chunks: Vec<_> = Whole.complete_stream(&[], &settings).collect().await;
        assert_eq!(chunks, vec![Ok("all at once".to_string())]);
    }

    #[test]
    fn settings_follow_config() {
        let config = AgentConfig::default().with_model("gpt-4o").with_max_tokens(64);
        let settings = CompletionSettings::from(&config);
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.max_tokens, 64);
        assert_eq!(settings.timeout, Duration::from_secs(60));
    }
}
