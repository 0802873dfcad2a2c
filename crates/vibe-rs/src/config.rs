//! Agent configuration with validated ranges.
//!
//! [`AgentConfig`] carries everything needed to build an agent and its
//! context windows. Values come from [`Default`], from the process
//! environment via [`from_env`](AgentConfig::from_env), or from any lookup
//! function via [`from_lookup`](AgentConfig::from_lookup).

use crate::ConfigError;
use crate::context::ContextWindow;
use std::fmt;
use std::ops::RangeInclusive;
use tracing::debug;

pub const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.0..=2.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<u32> = 1..=32_000;
pub const MAX_MESSAGE_LENGTH_RANGE: RangeInclusive<usize> = 1..=10_000;
pub const CONTEXT_BUDGET_RANGE: RangeInclusive<usize> = 64..=1_000_000;
pub const MAX_CONTEXT_MESSAGES_RANGE: RangeInclusive<usize> = 1..=100;
pub const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=10;
pub const TIMEOUT_RANGE: RangeInclusive<u64> = 1..=300;
/// One hour to one year.
pub const SESSION_TTL_HOURS_RANGE: RangeInclusive<u32> = 1..=8_760;

/// Runtime configuration for a chat agent.
#[derive(Clone, PartialEq)]
pub struct AgentConfig {
    /// Human-friendly agent name. Default: `"VibeCodingAgent"`.
    pub agent_name: String,
    /// Model or deployment name. Default: `"gpt-4"`.
    pub model: String,
    /// Sampling temperature. Default: `0.7`.
    pub temperature: f32,
    /// Maximum tokens per completion. Default: `2000`.
    pub max_tokens: u32,
    /// Maximum length (in characters) of a user message. Default: `4000`.
    pub max_message_length: usize,
    /// Token budget of each context window. Default: `4000`.
    pub context_budget: usize,
    /// Maximum number of history messages kept in a window. Default: `20`.
    pub max_context_messages: usize,
    /// Attempts per backend call. Default: `3`.
    pub max_retries: u32,
    pub api_key: String,
    pub endpoint: String,
    /// Backend request timeout in seconds. Default: `60`.
    pub timeout_secs: u64,
    /// Instructions pinned at the top of every window.
    pub system_message: Option<String>,
    /// Plugin names, resolved against a
    /// [`PluginCatalog`](crate::plugins::PluginCatalog).
    pub plugins: Vec<String>,
    /// Session lifetime. Default: `24`.
    pub session_ttl_hours: u32,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("agent_name", &self.agent_name)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_message_length", &self.max_message_length)
            .field("context_budget", &self.context_budget)
            .field("max_context_messages", &self.max_context_messages)
            .field("max_retries", &self.max_retries)
            .field("api_key", &"**********")
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .field("system_message", &self.system_message)
            .field("plugins", &self.plugins)
            .field("session_ttl_hours", &self.session_ttl_hours)
            .finish()
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "VibeCodingAgent".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.7,
            max_tokens: 2_000,
            max_message_length: 4_000,
            context_budget: crate::context::DEFAULT_BUDGET,
            max_context_messages: 20,
            max_retries: 3,
            api_key: String::new(),
            endpoint: String::new(),
            timeout_secs: 60,
            system_message: None,
            plugins: Vec::new(),
            session_ttl_hours: 24,
        }
    }
}

impl AgentConfig {
    /// Default config with the given credentials.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_context_budget(mut self, budget: usize) -> Self {
        self.context_budget = budget;
        self
    }

    pub fn with_max_context_messages(mut self, max: usize) -> Self {
        self.max_context_messages = max;
        self
    }

    pub fn with_system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    /// Check every ranged field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("temperature", self.temperature, &TEMPERATURE_RANGE)?;
        check_range("max_tokens", self.max_tokens, &MAX_TOKENS_RANGE)?;
        check_range(
            "max_message_length",
            self.max_message_length,
            &MAX_MESSAGE_LENGTH_RANGE,
        )?;
        check_range("context_budget", self.context_budget, &CONTEXT_BUDGET_RANGE)?;
        check_range(
            "max_context_messages",
            self.max_context_messages,
            &MAX_CONTEXT_MESSAGES_RANGE,
        )?;
        check_range("max_retries", self.max_retries, &MAX_RETRIES_RANGE)?;
        check_range("timeout", self.timeout_secs, &TIMEOUT_RANGE)?;
        check_range(
            "session_ttl_hours",
            self.session_ttl_hours,
            &SESSION_TTL_HOURS_RANGE,
        )?;
        Ok(())
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. The API key and endpoint are
    /// required; every other key falls back to its default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("AZURE_OPENAI_KEY").ok_or(ConfigError::Missing("AZURE_OPENAI_KEY"))?;
        let endpoint =
            get("AZURE_OPENAI_ENDPOINT").ok_or(ConfigError::Missing("AZURE_OPENAI_ENDPOINT"))?;

        let mut config = Self::new(endpoint, api_key);
        if let Some(model) = get("AZURE_OPENAI_CHAT_DEPLOYMENT_NAME") {
            config.model = model;
        }
        if let Some(name) = get("AGENT_NAME") {
            config.agent_name = name;
        }
        if let Some(v) = get("TEMPERATURE") {
            config.temperature = parse("temperature", &v)?;
        }
        if let Some(v) = get("MAX_TOKENS") {
            config.max_tokens = parse("max_tokens", &v)?;
        }
        if let Some(v) = get("MAX_MESSAGE_LENGTH") {
            config.max_message_length = parse("max_message_length", &v)?;
        }
        if let Some(v) = get("CONTEXT_BUDGET") {
            config.context_budget = parse("context_budget", &v)?;
        }
        if let Some(v) = get("MAX_CONTEXT_MESSAGES") {
            config.max_context_messages = parse("max_context_messages", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            config.max_retries = parse("max_retries", &v)?;
        }
        if let Some(v) = get("TIMEOUT") {
            config.timeout_secs = parse("timeout", &v)?;
        }
        if let Some(v) = get("SESSION_TTL_HOURS") {
            config.session_ttl_hours = parse("session_ttl_hours", &v)?;
        }
        config.system_message = get("SYSTEM_MESSAGE");
        if let Some(v) = get("AGENT_PLUGINS") {
            config.plugins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        debug!(?config, "Loaded agent configuration");
        Ok(config)
    }

    /// Cache key for agents built from this config:
    /// `endpoint:model:temperature:max_tokens`.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.endpoint, self.model, self.temperature, self.max_tokens
        )
    }

    /// An empty context window sized by this config.
    pub fn build_window(&self) -> ContextWindow {
        ContextWindow::new(self.context_budget).with_max_messages(Some(self.max_context_messages))
    }
}

fn check_range<T>(field: &'static str, value: T, range: &RangeInclusive<T>) -> Result<(), ConfigError>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!(
                "{value} is outside {}..={}",
                range.start(),
                range.end()
            ),
        })
    }
}

fn parse<T>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw.parse().map_err(|e| ConfigError::Invalid {
        field,
        reason: format!("'{raw}': {e}"),
    })
}
