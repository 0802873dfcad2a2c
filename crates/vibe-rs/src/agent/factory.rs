//! Agent construction and caching.
//!
//! [`AgentFactory`] is owned by the application (there is no global
//! instance). Agents are cached by [`AgentConfig::fingerprint`], so two
//! configs that differ only in fields outside the fingerprint share one
//! [`ChatAgent`].

use super::backend::CompletionSettings;
use crate::ConfigError;
use crate::config::AgentConfig;
use crate::context::ContextWindow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Instructions used when the config has no system message.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant.";

/// A configured agent: name, instructions and model settings.
#[derive(Debug, Clone)]
pub struct ChatAgent {
    name: String,
    instructions: String,
    settings: CompletionSettings,
    config: AgentConfig,
}

impl ChatAgent {
    pub fn new(config: AgentConfig) -> Self {
        let instructions = config
            .system_message
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());
        Self {
            name: config.agent_name.clone(),
            instructions,
            settings: CompletionSettings::from(&config),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// A fresh context window seeded with this agent's instructions as the
    /// pinned system message.
    pub fn new_window(&self) -> ContextWindow {
        self.config
            .build_window()
            .with_system_prompt(self.instructions.clone())
    }
}

/// Builds [`ChatAgent`]s and caches them by config fingerprint.
#[derive(Debug, Default)]
pub struct AgentFactory {
    cache: Mutex<HashMap<String, Arc<ChatAgent>>>,
}

impl AgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached agent for `config`, or build and cache a new one.
    pub fn create_agent(&self, config: &AgentConfig) -> Result<Arc<ChatAgent>, ConfigError> {
        validate_credentials(config)?;
        config.validate()?;

        let key = config.fingerprint();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(agent) = cache.get(&key) {
            debug!(cache_key = %key, "Returning cached agent");
            return Ok(Arc::clone(agent));
        }

        let agent = Arc::new(ChatAgent::new(config.clone()));
        info!(
            agent = agent.name(),
            model = %config.model,
            cache_key = %key,
            "Created agent"
        );
        cache.insert(key, Arc::clone(&agent));
        Ok(agent)
    }

    /// Load the config from the environment, then [`create_agent`](Self::create_agent).
    pub fn create_from_env(&self) -> Result<Arc<ChatAgent>, ConfigError> {
        let config = AgentConfig::from_env()?;
        self.create_agent(&config)
    }

    /// Drop the cached agent for `config`. Returns whether one was cached.
    pub fn invalidate(&self, config: &AgentConfig) -> bool {
        let removed = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&config.fingerprint())
            .is_some();
        if removed {
            debug!(cache_key = %config.fingerprint(), "Invalidated cached agent");
        }
        removed
    }

    /// Drop every cached agent. Returns how many were dropped.
    pub fn clear_cache(&self) -> usize {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let cleared = cache.len();
        cache.clear();
        info!(cleared, "Cleared agent cache");
        cleared
    }

    pub fn cache_size(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn validate_credentials(config: &AgentConfig) -> Result<(), ConfigError> {
    if config.endpoint.trim().is_empty() {
        return Err(ConfigError::Missing("endpoint"));
    }
    if config.api_key.trim().is_empty() {
        return Err(ConfigError::Missing("api_key"));
    }
    if config.model.trim().is_empty() {
        return Err(ConfigError::Missing("model"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageRole;

    fn config() -> AgentConfig {
        AgentConfig::new("https://example.openai.azure.com", "key")
    }

    #[test]
    fn caches_by_fingerprint() {
        let factory = AgentFactory::new();
        let a = factory.create_agent(&config()).unwrap();
        let b = factory.create_agent(&config()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.cache_size(), 1);

        let c = factory
            .create_agent(&config().with_temperature(0.1))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.cache_size(), 2);
    }

    #[test]
    fn fields_outside_fingerprint_share_an_agent() {
        let factory = AgentFactory::new();
        let a = factory.create_agent(&config()).unwrap();
        let b = factory
            .create_agent(&config().with_system_message("Different"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.instructions(), DEFAULT_INSTRUCTIONS);
    }

    #[test]
    fn rejects_missing_credentials() {
        let factory = AgentFactory::new();
        let err = factory
            .create_agent(&AgentConfig::new("", "key"))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("endpoint"));
        let err = factory
            .create_agent(&AgentConfig::new("https://e", " "))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("api_key"));
        let err = factory
            .create_agent(&config().with_model(""))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("model"));
        assert_eq!(factory.cache_size(), 0);
    }

    #[test]
    fn rejects_out_of_range_config() {
        let factory = AgentFactory::new();
        let err = factory
            .create_agent(&config().with_temperature(3.0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "temperature", .. }));
    }

    #[test]
    fn invalidate_and_clear() {
        let factory = AgentFactory::new();
        factory.create_agent(&config()).unwrap();
        factory.create_agent(&config().with_max_tokens(10)).unwrap();

        assert!(factory.invalidate(&config()));
        assert!(!factory.invalidate(&config()));
        assert_eq!(factory.cache_size(), 1);
        assert_eq!(factory.clear_cache(), 1);
        assert_eq!(factory.cache_size(), 0);
    }

    #[test]
    fn new_window_is_seeded_with_instructions() {
        let agent = ChatAgent::new(config().with_system_message("Be terse."));
        let window = agent.new_window();
        let pinned: Vec<_> = window.pinned().collect();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].role(), MessageRole::System);
        assert_eq!(pinned[0].content(), "Be terse.");
        assert_eq!(window.budget(), agent.config().context_budget);
    }

    #[test]
    fn blank_system_message_falls_back_to_default() {
        let agent = ChatAgent::new(config().with_system_message("  "));
        assert_eq!(agent.instructions(), DEFAULT_INSTRUCTIONS);
    }
}
