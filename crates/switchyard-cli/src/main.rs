use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, ollama, openai, openrouter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use switchyard_channels::{ChannelManager, ConsoleChannel};
use switchyard_config::{
    data_dir, find_config_path, load_config, resolve_workspace, sessions_dir, Config,
};
use switchyard_core::agent::{
    AgentLoop, AgentSettings, ContextBudget, ContextBuilder, SkillsLoader, SubagentManager,
    SubagentSettings,
};
use switchyard_core::bus::{MessageBus, OutboundMessage};
use switchyard_core::providers::{LLMProvider, RigProvider};
use switchyard_core::session::{JsonlSessionStore, SessionLimits, SessionManager, SessionStore};
use switchyard_core::tools::message::MessageTool;
use switchyard_core::tools::spawn::SpawnTool;
use switchyard_core::tools::ToolRegistry;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for in-flight bus deliveries at exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Render markdown text to the terminal using termimad.
fn render_markdown(text: &str) {
    let skin = termimad::MadSkin::default();
    skin.print_text(text);
}

#[derive(Parser)]
#[command(name = "switchyard", about = "Multi-channel AI agent with background subagents", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent from the terminal
    Agent {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,

        /// Session key for conversation tracking (channel:chat_id)
        #[arg(short, long, default_value = "cli:interactive")]
        session: String,
    },
    /// Run the bus with the console channel until Ctrl-C
    Serve,
    /// Show configuration and workspace status
    Status,
    /// List stored sessions
    Sessions {
        /// Delete the session with this key
        #[arg(long)]
        delete: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},switchyard_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);
    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Status => run_status(&config_path, &config).await,
        Commands::Sessions { delete } => run_sessions(&config, delete.as_deref()).await,
        Commands::Agent { message, session } => {
            let runtime = Runtime::build(&config)?;
            let result = match message {
                Some(msg) => run_single_message(&runtime, &session, &msg).await,
                None => run_interactive(&runtime, &session).await,
            };
            runtime.shutdown().await;
            result
        }
        Commands::Serve => run_gateway(&config).await,
    }
}

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(
    provider_cfg: &Option<switchyard_config::ProviderConfig>,
    env_var: &str,
) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

fn api_base(provider_cfg: &Option<switchyard_config::ProviderConfig>) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_base.clone())
        .filter(|b| !b.is_empty())
}

fn missing_key(name: &str, field: &str, env_var: &str) -> anyhow::Error {
    anyhow::anyhow!(
        "{name} provider selected but no API key found. \
         Set providers.{field}.apiKey in config.json or {env_var} env var."
    )
}

/// Create a completion model for the configured provider + model.
#[allow(deprecated)]
fn create_model(config: &Config) -> Result<CompletionModelHandle<'static>> {
    let provider = config.agents.defaults.provider.as_str();
    let model_name = config.agents.defaults.model.as_str();
    let providers = &config.providers;

    if provider.is_empty() {
        anyhow::bail!(
            "No provider configured.\n\
             Set agents.defaults.provider to one of: anthropic, openai, ollama, openrouter"
        );
    }
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }

    match provider {
        "anthropic" => {
            let key = resolve_api_key(&providers.anthropic, "ANTHROPIC_API_KEY")
                .ok_or_else(|| missing_key("Anthropic", "anthropic", "ANTHROPIC_API_KEY"))?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            tracing::info!("Using Anthropic provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }
        "openai" => {
            let key = resolve_api_key(&providers.openai, "OPENAI_API_KEY")
                .ok_or_else(|| missing_key("OpenAI", "openai", "OPENAI_API_KEY"))?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(base) = api_base(&providers.openai) {
                tracing::info!("Using OpenAI provider with custom base: {base}");
                builder = builder.base_url(&base);
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenAI provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }
        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(base) = api_base(&providers.ollama) {
                builder = builder.base_url(&base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using Ollama provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }
        "openrouter" => {
            let key = resolve_api_key(&providers.openrouter, "OPENROUTER_API_KEY")
                .ok_or_else(|| missing_key("OpenRouter", "openrouter", "OPENROUTER_API_KEY"))?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            let model = client.completion_model(model_name);
            tracing::info!("Using OpenRouter provider with model '{model_name}'");
            Ok(CompletionModelHandle::new(Arc::new(model)))
        }
        other => anyhow::bail!(
            "Unknown provider '{other}'. Valid providers: anthropic, openai, ollama, openrouter"
        ),
    }
}

fn session_manager(config: &Config) -> SessionManager {
    SessionManager::new(
        Arc::new(JsonlSessionStore::new(sessions_dir(config))),
        SessionLimits {
            max_messages: config.session.max_messages,
            max_chars: config.session.max_chars,
        },
    )
}

/// Everything the `agent` and `serve` commands run on.
struct Runtime {
    bus: Arc<MessageBus>,
    agent: Arc<AgentLoop>,
    subagents: Arc<SubagentManager>,
    subagent_timeout: Duration,
    shutdown: CancellationToken,
}

impl Runtime {
    fn build(config: &Config) -> Result<Self> {
        let workspace = resolve_workspace(&config.agents.defaults.workspace);
        std::fs::create_dir_all(&workspace)?;

        let model_name = config.agents.defaults.model.clone();
        let provider: Arc<dyn LLMProvider> =
            Arc::new(RigProvider::new(model_name, create_model(config)?));
        let bus = Arc::new(MessageBus::new(config.bus.capacity));

        let budget = ContextBudget {
            max_chars: config.context.max_chars,
            history_turns: config.context.history_turns,
            max_memory_entries: config.context.max_memory_entries,
        };
        let shared_skills = data_dir().join("skills");
        let context = ContextBuilder::new(&workspace, Some(&shared_skills), budget)?;

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(MessageTool::new(bus.clone())));
        let subagents = Arc::new(SubagentManager::new(
            provider.clone(),
            &tools,
            bus.clone(),
            workspace.clone(),
            SubagentSettings::from_config(&config.subagents, &config.agents.defaults),
        ));
        tools.register(Arc::new(SpawnTool::new(subagents.clone())));

        let agent = Arc::new(AgentLoop::new(
            bus.clone(),
            provider,
            Arc::new(session_manager(config)),
            context,
            tools,
            AgentSettings::from_defaults(&config.agents.defaults),
        ));

        Ok(Self {
            bus,
            agent,
            subagents,
            subagent_timeout: Duration::from_secs(config.subagents.timeout_secs),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the inbound dispatcher so subagent reports get processed.
    async fn start_dispatcher(&self) -> tokio::task::JoinHandle<()> {
        let inbound = self.bus.inbound_queue().await;
        tokio::spawn(self.agent.clone().run(inbound, self.shutdown.clone()))
    }

    /// Stop turns, let subagents report, then drain the bus.
    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.subagents.shutdown().await;
        if tokio::time::timeout(SHUTDOWN_GRACE, self.bus.shutdown())
            .await
            .is_err()
        {
            tracing::warn!("Message bus did not drain within {SHUTDOWN_GRACE:?}");
        }
    }
}

fn split_session(session_key: &str) -> (&str, &str) {
    session_key.split_once(':').unwrap_or(("cli", session_key))
}

/// Print replies that arrive on the bus for `channel:chat_id` outside a
/// direct call, i.e. answers to subagent reports.
fn spawn_printer(
    mut outbound: mpsc::Receiver<OutboundMessage>,
    channel: String,
    chat_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if msg.channel == channel && msg.chat_id == chat_id {
                println!();
                render_markdown(&msg.content);
                println!();
            }
        }
    })
}

async fn run_single_message(runtime: &Runtime, session_key: &str, message: &str) -> Result<()> {
    let (channel, chat_id) = split_session(session_key);
    let mut outbound = runtime.bus.outbound_queue().await;
    let _dispatcher = runtime.start_dispatcher().await;

    let response = runtime
        .agent
        .process_direct(message, session_key, channel, chat_id)
        .await?;
    render_markdown(&response);

    // Each subagent yields exactly one report, and each report one reply.
    let pending = runtime.subagents.list().len();
    if pending == 0 {
        return Ok(());
    }
    println!("Waiting for {pending} background task(s)...");
    // Queued subagents may wait for a slot before their own timeout starts.
    let deadline = tokio::time::Instant::now() + runtime.subagent_timeout * 2;
    let mut received = 0;
    while received < pending {
        match tokio::time::timeout_at(deadline, outbound.recv()).await {
            Ok(Some(msg)) if msg.channel == channel && msg.chat_id == chat_id => {
                println!();
                render_markdown(&msg.content);
                received += 1;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    Ok(())
}

async fn run_interactive(runtime: &Runtime, session_key: &str) -> Result<()> {
    let (channel, chat_id) = split_session(session_key);
    let _printer = spawn_printer(
        runtime.bus.outbound_queue().await,
        channel.to_string(),
        chat_id.to_string(),
    );
    let _dispatcher = runtime.start_dispatcher().await;

    let history_path = data_dir().join("history").join("cli_history");
    if let Some(dir) = history_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("switchyard interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    loop {
        // rustyline blocks; keep it off the runtime's worker threads.
        let (editor, readline) = tokio::task::spawn_blocking(move || {
            let line = rl.readline("you> ");
            (rl, line)
        })
        .await?;
        rl = editor;

        match readline {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                if matches!(input, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                    break;
                }

                match runtime
                    .agent
                    .process_direct(input, session_key, channel, chat_id)
                    .await
                {
                    Ok(response) => {
                        println!();
                        render_markdown(&response);
                        println!();
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        println!();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

/// Run the agent behind the bus with the console channel attached.
async fn run_gateway(config: &Config) -> Result<()> {
    let runtime = Runtime::build(config)?;
    let channels = ChannelManager::new();
    channels.register(Arc::new(ConsoleChannel::stdio())).await;

    let dispatcher = runtime.start_dispatcher().await;
    channels.start_all(runtime.bus.clone()).await;
    tracing::info!(
        "Gateway running with channels: {}",
        channels.enabled_channels().await.join(", ")
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    channels.stop_all(&runtime.bus).await;
    runtime.shutdown().await;
    if let Err(e) = dispatcher.await {
        tracing::error!("Agent dispatcher ended abnormally: {e}");
    }
    Ok(())
}

async fn run_status(config_path: &Path, config: &Config) -> Result<()> {
    println!("switchyard status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!("  Config:    {} (not found, using defaults)", config_path.display());
    }

    let workspace = resolve_workspace(&config.agents.defaults.workspace);
    println!(
        "  Workspace: {} ({})",
        workspace.display(),
        if workspace.exists() { "found" } else { "not found" }
    );

    let defaults = &config.agents.defaults;
    let or_unset = |s: &str| if s.is_empty() { "(not set)".to_string() } else { s.to_string() };
    println!("  Provider:  {}", or_unset(&defaults.provider));
    println!("  Model:     {}", or_unset(&defaults.model));
    println!(
        "  Loop:      {} iterations, {} tool calls at once",
        defaults.max_tool_iterations, defaults.tool_concurrency
    );
    println!(
        "  Subagents: {} concurrent, {}s timeout, {} iterations",
        config.subagents.max_concurrent, config.subagents.timeout_secs, config.subagents.max_iterations
    );
    println!("  Context:   {} chars", config.context.max_chars);
    println!();

    let store = JsonlSessionStore::new(sessions_dir(config));
    let sessions = store.list().await.map(|s| s.len()).unwrap_or(0);
    println!("  Sessions:  {} in {}", sessions, sessions_dir(config).display());

    let shared_skills = data_dir().join("skills");
    let skills = SkillsLoader::new(&workspace, Some(&shared_skills))?.list_skills();
    let available = skills.iter().filter(|s| s.available).count();
    println!("  Skills:    {} ({} available)", skills.len(), available);

    let memory = workspace.join("memory").join("MEMORY.md");
    println!(
        "  Memory:    {}",
        if memory.exists() { "present" } else { "empty" }
    );
    Ok(())
}

async fn run_sessions(config: &Config, delete: Option<&str>) -> Result<()> {
    let sessions = session_manager(config);

    if let Some(key) = delete {
        if sessions.delete(key).await? {
            println!("Deleted session '{key}'.");
        } else {
            println!("No session named '{key}'.");
        }
        return Ok(());
    }

    let list = sessions.list().await?;
    if list.is_empty() {
        println!("No sessions stored in {}", sessions_dir(config).display());
        return Ok(());
    }
    println!("{:<32} {:>8}  {}", "SESSION", "MESSAGES", "UPDATED");
    for info in list {
        let updated = chrono::DateTime::parse_from_rfc3339(&info.updated_at)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or(info.updated_at);
        println!("{:<32} {:>8}  {}", info.key, info.messages, updated);
    }
    Ok(())
}
