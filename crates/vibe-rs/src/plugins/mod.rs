//! Plugin abstraction: capabilities an agent can invoke by name.
//!
//! The [`Plugin`] trait is the fixed capability interface: identity
//! (name, description, version), a function-calling JSON schema, lifecycle
//! hooks, and an async `execute` taking and returning JSON. Plugins are
//! collected in a [`PluginRegistry`], which handles validation, enablement,
//! argument checking and dispatch.
//!
//! Nothing is loaded dynamically. Plugins named in configuration are
//! resolved against a [`PluginCatalog`] of compiled-in constructors, and
//! names missing from the catalog are rejected at start-up.

pub mod calculator;

pub use calculator::{CALCULATOR_NAME, Calculator};

use crate::PluginError;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Boxed future returned by [`Plugin::execute`].
pub type PluginFuture<'a> = BoxFuture<'a, Result<serde_json::Value, PluginError>>;

/// Constructor stored in a [`PluginCatalog`].
pub type PluginConstructor = fn() -> Box<dyn Plugin>;

// ── Plugin trait ───────────────────────────────────────────────────

/// A capability an agent can invoke.
///
/// # Example
///
/// ```
/// use vibe_rs::plugins::{Plugin, PluginFuture};
/// use serde_json::json;
///
/// struct Echo;
///
/// impl Plugin for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn description(&self) -> &str { "Returns its input." }
///     fn version(&self) -> &str { "0.1.0" }
///     fn schema(&self) -> serde_json::Value {
///         json!({"name": "echo", "description": "Returns its input.",
///                "parameters": {"type": "object"}})
///     }
///     fn execute(&self, args: serde_json::Value) -> PluginFuture<'_> {
///         Box::pin(async move { Ok(args) })
///     }
/// }
/// ```
pub trait Plugin: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn version(&self) -> &str;

    /// Function-calling schema: an object with at least `name`, usually
    /// also `description` and a JSON Schema under `parameters`.
    fn schema(&self) -> serde_json::Value;

    /// Called once when the plugin is registered.
    fn initialize(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Run the plugin with JSON arguments.
    fn execute(&self, args: serde_json::Value) -> PluginFuture<'_>;

    /// Called once when the plugin is unregistered or the registry is dropped.
    fn cleanup(&mut self) {}
}

/// Listing entry returned by [`PluginRegistry::list`].
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub version: String,
    pub enabled: bool,
}

// ── Catalog ────────────────────────────────────────────────────────

/// Compiled-in plugins that configuration may refer to by name.
#[derive(Clone)]
pub struct PluginCatalog {
    constructors: HashMap<String, PluginConstructor>,
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginCatalog {
    /// An empty catalog.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// The plugins that ship with this crate.
    pub fn builtin() -> Self {
        Self::empty().with(CALCULATOR_NAME, || Box::new(Calculator::new()))
    }

    /// Add (or replace) a constructor (builder pattern).
    pub fn with(mut self, name: impl Into<String>, constructor: PluginConstructor) -> Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Catalog names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate a plugin by name.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Plugin>, PluginError> {
        self.constructors
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| PluginError::Unknown(name.to_string()))
    }
}

impl Default for PluginCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

// ── Registry ───────────────────────────────────────────────────────

struct Registered {
    plugin: Box<dyn Plugin>,
    enabled: bool,
}

/// Plugins available to an agent, dispatched by name.
///
/// # Example
///
/// ```
/// use vibe_rs::plugins::{Calculator, PluginRegistry};
/// use serde_json::json;
///
/// # tokio_test_block(async {
/// let mut registry = PluginRegistry::new();
/// registry.register(Calculator::new()).unwrap();
///
/// let out = registry
///     .execute("calculator", json!({"expression": "6 * 7"}))
///     .await
///     .unwrap();
/// assert_eq!(out["result"], 42.0);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct PluginRegistry {
    plugins: BTreeMap<String, Registered>,
    /// Validate arguments against each plugin's parameter schema.
    validate_args: bool,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("validate_args", &self.validate_args)
            .finish()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Create an empty registry with argument validation enabled.
    pub fn new() -> Self {
        Self {
            plugins: BTreeMap::new(),
            validate_args: true,
        }
    }

    /// Enable or disable JSON Schema argument validation before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Build a registry from configured plugin names. Every name must exist
    /// in `catalog`; the first unknown name aborts with
    /// [`PluginError::Unknown`].
    pub fn from_config<S: AsRef<str>>(
        names: &[S],
        catalog: &PluginCatalog,
    ) -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for name in names {
            let plugin = catalog.instantiate(name.as_ref())?;
            registry.register_boxed(plugin)?;
        }
        info!(plugins = registry.len(), "Plugins loaded from configuration");
        Ok(registry)
    }

    /// Register a plugin.
    pub fn register(&mut self, plugin: impl Plugin + 'static) -> Result<(), PluginError> {
        self.register_boxed(Box::new(plugin))
    }

    /// Register an already boxed plugin: validates identity and schema,
    /// rejects duplicate names, then calls [`Plugin::initialize`].
    pub fn register_boxed(&mut self, mut plugin: Box<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        validate_plugin(plugin.as_ref())?;

        if self.plugins.contains_key(&name) {
            return Err(PluginError::Registration {
                name,
                reason: "a plugin with this name is already registered".into(),
            });
        }

        plugin
            .initialize()
            .map_err(|e| PluginError::Registration {
                name: name.clone(),
                reason: format!("initialization failed: {e}"),
            })?;

        info!(
            plugin = %name,
            version = plugin.version(),
            "Plugin registered"
        );
        self.plugins.insert(
            name,
            Registered {
                plugin,
                enabled: true,
            },
        );
        Ok(())
    }

    /// Register a plugin (builder pattern).
    pub fn with(mut self, plugin: impl Plugin + 'static) -> Result<Self, PluginError> {
        self.register(plugin)?;
        Ok(self)
    }

    /// Remove a plugin, calling [`Plugin::cleanup`].
    pub fn unregister(&mut self, name: &str) -> Result<(), PluginError> {
        let mut entry = self
            .plugins
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        entry.plugin.cleanup();
        info!(plugin = name, "Plugin unregistered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&dyn Plugin, PluginError> {
        self.plugins
            .get(name)
            .map(|r| r.plugin.as_ref())
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Enable or disable a plugin without unregistering it.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let entry = self
            .plugins
            .get_mut(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        entry.enabled = enabled;
        debug!(plugin = name, enabled, "Plugin enablement changed");
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.plugins.get(name).is_some_and(|r| r.enabled)
    }

    /// All registered plugins, sorted by name.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .values()
            .map(|r| PluginInfo {
                name: r.plugin.name().to_string(),
                description: r.plugin.description().to_string(),
                version: r.plugin.version().to_string(),
                enabled: r.enabled,
            })
            .collect()
    }

    /// Function-calling schemas of the enabled plugins.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.plugins
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.plugin.schema())
            .collect()
    }

    /// Execute a plugin by name.
    ///
    /// Fails with [`PluginError::NotFound`] for unknown names,
    /// [`PluginError::Disabled`] for disabled plugins, and
    /// [`PluginError::InvalidArguments`] when validation is on and `args`
    /// do not match the plugin's parameter schema.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        let entry = self
            .plugins
            .get(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        if !entry.enabled {
            return Err(PluginError::Disabled(name.to_string()));
        }

        if self.validate_args {
            validate_arguments(entry.plugin.as_ref(), &args)?;
        }

        let preview: String = args.to_string().chars().take(120).collect();
        debug!("Plugin {name}({preview})");
        let start = std::time::Instant::now();

        let result = entry.plugin.execute(args).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => debug!("Plugin {name} completed in {elapsed_ms:.0}ms"),
            Err(e) => warn!("Plugin {name} failed after {elapsed_ms:.0}ms: {e}"),
        }
        result
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        for entry in self.plugins.values_mut() {
            entry.plugin.cleanup();
        }
    }
}

/// Check a plugin's identity and schema before registration.
fn validate_plugin(plugin: &dyn Plugin) -> Result<(), PluginError> {
    let name = plugin.name();
    let fail = |reason: &str| PluginError::Registration {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(fail("name must be non-empty ASCII letters, digits, '_' or '-'"));
    }
    if plugin.version().trim().is_empty() {
        return Err(fail("version is empty"));
    }

    let schema = plugin.schema();
    let Some(obj) = schema.as_object() else {
        return Err(fail("schema must be a JSON object"));
    };
    if !obj.get("name").is_some_and(|n| n.is_string()) {
        return Err(fail("schema has no string 'name'"));
    }
    if let Some(params) = obj.get("parameters")
        && jsonschema::validator_for(params).is_err()
    {
        return Err(fail("schema 'parameters' is not a valid JSON Schema"));
    }
    Ok(())
}

/// Validate `args` against the plugin's `parameters` schema, if it has one.
fn validate_arguments(plugin: &dyn Plugin, args: &serde_json::Value) -> Result<(), PluginError> {
    let schema = plugin.schema();
    let Some(params) = schema.get("parameters") else {
        return Ok(());
    };
    let Ok(validator) = jsonschema::validator_for(params) else {
        return Ok(());
    };

    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(PluginError::InvalidArguments {
            name: plugin.name().to_string(),
            reason: errors.join("; "),
        })
    }
}
