//! `vibe`: inspect context windows, run plugins, and chat offline.
//!
//! # Examples
//!
//! ```sh
//! # Feed a JSON array of messages through a 200-token window
//! vibe inspect conversation.json --budget 200
//!
//! # Check whether the minimal context fits a smaller limit
//! vibe inspect conversation.json --budget 200 --max-tokens 120
//!
//! # List built-in plugins / evaluate an expression
//! vibe plugins
//! vibe calc "2 ** 10 + sqrt(16)"
//!
//! # Line-based chat against the echo backend, persisted to ./sessions
//! # (inside the chat: /plugin calculator {"expression": "6 * 7"})
//! AGENT_PLUGINS=calculator vibe chat --budget 300 --session-dir ./sessions
//! ```
//!
//! Logging goes to stderr and is filtered by `RUST_LOG` (default `warn`,
//! `--verbose` raises it to `debug`).

use clap::{Parser, Subcommand};
use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vibe_rs::agent::{AgentFactory, ConversationAgent, EchoBackend};
use vibe_rs::config::AgentConfig;
use vibe_rs::context::{ContextWindow, parse_messages};
use vibe_rs::plugins::{CALCULATOR_NAME, PluginCatalog, PluginRegistry};
use vibe_rs::session::{SessionRegistry, SessionStore};
use vibe_rs::{ConfigError, MessageRole};

/// How often `vibe chat` flushes sessions when `--session-dir` is set.
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

type CliResult = Result<(), Box<dyn Error>>;

/// Token-budgeted conversation toolkit.
#[derive(Parser)]
#[command(name = "vibe", version)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a JSON array of messages into a window and report what survives
    Inspect {
        /// File with `[{"role": ..., "content": ...}, ...]`
        file: PathBuf,

        /// Window budget in estimated tokens
        #[arg(long, default_value_t = vibe_rs::context::DEFAULT_BUDGET)]
        budget: usize,

        /// Retrieve with this token limit instead of the budget
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Cap on retained history messages
        #[arg(long)]
        max_messages: Option<usize>,

        /// Treat system messages as ordinary history
        #[arg(long)]
        no_pin_system: bool,
    },

    /// List built-in plugins
    Plugins {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate an arithmetic expression with the calculator plugin
    Calc {
        expression: String,
    },

    /// Chat line by line against the offline echo backend
    Chat {
        /// Window budget in estimated tokens (default: CONTEXT_BUDGET or 4000)
        #[arg(long)]
        budget: Option<usize>,

        /// Persist sessions as JSON files in this directory
        #[arg(long)]
        session_dir: Option<PathBuf>,

        /// Resume an existing session (requires --session-dir)
        #[arg(long)]
        session: Option<String>,

        /// Print each reply only once it is complete
        #[arg(long)]
        no_stream: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Inspect {
            file,
            budget,
            max_tokens,
            max_messages,
            no_pin_system,
        } => inspect(&file, budget, max_tokens, max_messages, !no_pin_system),
        Command::Plugins { json } => list_plugins(json),
        Command::Calc { expression } => calc(&expression).await,
        Command::Chat {
            budget,
            session_dir,
            session,
            no_stream,
        } => chat(budget, session_dir, session, !no_stream).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ── inspect ─────────────────────────────────────────────────────────

fn inspect(
    file: &Path,
    budget: usize,
    max_tokens: Option<usize>,
    max_messages: Option<usize>,
    pin_system: bool,
) -> CliResult {
    let json = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    let messages = parse_messages(&json)?;
    info!(count = messages.len(), "Loaded messages");

    let mut window = ContextWindow::new(budget)
        .with_pin_system(pin_system)
        .with_max_messages(max_messages);
    for message in messages {
        window.append(message)?;
    }

    println!("Retained context ({} messages):", window.len());
    for message in window.pinned() {
        print_message("pinned", message, window.cost_of(message));
    }
    for message in window.history() {
        print_message("history", message, window.cost_of(message));
    }
    println!();
    println!("{}", window.usage().to_log_string());
    println!("evicted: {}", window.evicted_total());
    println!("overflow: {}", window.is_overflowing());

    if let Some(limit) = max_tokens {
        let context = window.retrieve(limit)?;
        println!("retrieve({limit}): {} messages", context.len());
    }
    Ok(())
}

fn print_message(kind: &str, message: &vibe_rs::Message, cost: usize) {
    let preview: String = message.content().chars().take(60).collect();
    let ellipsis = if message.content().chars().count() > 60 {
        "…"
    } else {
        ""
    };
    println!(
        "  [{kind:<7}] {:<9} {cost:>5} tok  {preview}{ellipsis}",
        message.role().as_str()
    );
}

// ── plugins / calc ──────────────────────────────────────────────────

fn list_plugins(json: bool) -> CliResult {
    let catalog = PluginCatalog::builtin();
    let registry = PluginRegistry::from_config(&catalog.names(), &catalog)?;
    let plugins = registry.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&plugins)?);
        return Ok(());
    }
    for plugin in plugins {
        println!(
            "{:<12} {:<8} {}",
            plugin.name, plugin.version, plugin.description
        );
    }
    Ok(())
}

async fn calc(expression: &str) -> CliResult {
    let registry = PluginRegistry::from_config(&[CALCULATOR_NAME], &PluginCatalog::builtin())?;
    let output = registry
        .execute(CALCULATOR_NAME, serde_json::json!({ "expression": expression }))
        .await?;
    println!("{}", output["result"]);
    Ok(())
}

// ── chat ────────────────────────────────────────────────────────────

/// Config from the environment, with placeholder credentials when none are
/// set. The echo backend ignores them.
fn chat_config(budget: Option<usize>) -> Result<AgentConfig, ConfigError> {
    let mut config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(key)) => {
            debug!("{key} not set, using offline placeholders");
            AgentConfig::new("offline", "offline")
        }
        Err(e) => return Err(e),
    };
    if let Some(budget) = budget {
        config.context_budget = budget;
    }
    config.validate()?;
    Ok(config)
}

async fn chat(
    budget: Option<usize>,
    session_dir: Option<PathBuf>,
    resume: Option<String>,
    stream: bool,
) -> CliResult {
    let config = chat_config(budget)?;
    let factory = AgentFactory::new();
    let agent = factory.create_agent(&config)?;

    let mut registry = SessionRegistry::for_agent(Arc::clone(&agent));
    if let Some(dir) = &session_dir {
        registry = registry.with_store(SessionStore::new(dir)?);
    }
    let sessions = Arc::new(registry);
    if session_dir.is_some() {
        let loaded = sessions.load_all()?;
        debug!(loaded, "Restored sessions");
        sessions.spawn_autosave(AUTOSAVE_INTERVAL);
    }

    let session_id = match resume {
        Some(id) => {
            sessions.get(&id).await?;
            id
        }
        None => sessions.create(None)?,
    };

    let plugins = PluginRegistry::from_config(&config.plugins, &PluginCatalog::builtin())?;
    let driver = ConversationAgent::new(agent, EchoBackend::new(), Arc::clone(&sessions))
        .with_plugins(plugins);

    println!(
        "session {session_id} \
         (/reset clears history, /plugin <name> <json> runs a plugin, /quit exits)"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                driver.reset(&session_id).await?;
                println!("(history cleared)");
                continue;
            }
            _ => {}
        }
        if let Some(rest) = line
            .strip_prefix("/plugin")
            .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        {
            run_plugin(&driver, &session_id, rest.trim()).await;
            continue;
        }

        let result = if stream {
            print!("{}: ", MessageRole::Assistant);
            let result = driver
                .chat_stream(&session_id, line, |chunk| {
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                })
                .await;
            println!();
            result
        } else {
            driver.chat(&session_id, line).await.inspect(|turn| {
                println!("{}: {}", MessageRole::Assistant, turn.reply);
            })
        };

        match result {
            Ok(turn) => {
                let mut notes = Vec::new();
                if turn.evicted > 0 {
                    notes.push(format!("{} evicted", turn.evicted));
                }
                if turn.cached {
                    notes.push("cached".to_string());
                }
                if turn.overflow {
                    notes.push("over budget, /reset to continue".to_string());
                }
                let notes: String = notes.iter().map(|n| format!(", {n}")).collect();
                println!("   ({}{notes})", turn.usage.to_log_string());
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    let metrics = driver.metrics();
    println!(
        "{} turns, {} failures, {} cached, ~{} tokens, avg {:.0}ms",
        metrics.turns,
        metrics.failures,
        metrics.cache_hits,
        metrics.token_usage.total_tokens,
        metrics.average_response_time.as_secs_f64() * 1000.0
    );
    let saved = sessions.shutdown().await;
    if session_dir.is_some() {
        info!(saved, "Sessions flushed");
    }
    Ok(())
}

/// Split `/plugin` input into a plugin name and JSON arguments, which
/// default to `{}`. `Ok(None)` when no name was given.
fn parse_plugin_command(
    input: &str,
) -> Result<Option<(&str, serde_json::Value)>, serde_json::Error> {
    let input = input.trim();
    let (name, raw_args) = match input.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (input, ""),
    };
    if name.is_empty() {
        return Ok(None);
    }
    let args = if raw_args.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(raw_args)?
    };
    Ok(Some((name, args)))
}

async fn run_plugin(driver: &ConversationAgent, session_id: &str, input: &str) {
    let (name, args) = match parse_plugin_command(input) {
        Ok(Some(command)) => command,
        Ok(None) => {
            let names: Vec<_> = driver.plugins().list().into_iter().map(|p| p.name).collect();
            println!("usage: /plugin <name> <json>  (loaded: {})", names.join(", "));
            return;
        }
        Err(e) => {
            eprintln!("Error: arguments are not valid JSON: {e}");
            return;
        }
    };

    match driver.invoke_plugin(session_id, name, args).await {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("Error: {e}"),
        },
        Err(e) => eprintln!("Error: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_command_parses_name_and_args() {
        let (name, args) = parse_plugin_command(r#"calculator {"expression": "6 * 7"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(name, "calculator");
        assert_eq!(args, json!({"expression": "6 * 7"}));
    }

    #[test]
    fn plugin_command_defaults_args_and_rejects_bad_json() {
        let (name, args) = parse_plugin_command("  calculator ").unwrap().unwrap();
        assert_eq!(name, "calculator");
        assert_eq!(args, json!({}));

        assert!(parse_plugin_command("").unwrap().is_none());
        assert!(parse_plugin_command("calculator {oops").is_err());
    }

    #[tokio::test]
    async fn configured_plugins_are_reachable_from_chat() {
        let config = AgentConfig::new("offline", "offline").with_plugins([CALCULATOR_NAME]);
        let agent = AgentFactory::new().create_agent(&config).unwrap();
        let sessions = Arc::new(SessionRegistry::for_agent(Arc::clone(&agent)));
        let id = sessions.create(None).unwrap();
        let plugins =
            PluginRegistry::from_config(&config.plugins, &PluginCatalog::builtin()).unwrap();
        let driver =
            ConversationAgent::new(agent, EchoBackend::new(), sessions).with_plugins(plugins);

        let (name, args) = parse_plugin_command(r#"calculator {"expression": "6 * 7"}"#)
            .unwrap()
            .unwrap();
        let output = driver.invoke_plugin(&id, name, args).await.unwrap();
        assert_eq!(output["result"], 42.0);
    }
}
