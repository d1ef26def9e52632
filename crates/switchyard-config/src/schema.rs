use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub context: ContextConfig,
    pub session: SessionConfig,
    pub subagents: SubagentConfig,
    pub bus: BusConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub workspace: String,
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_iterations: usize,
    /// Upper bound on tool calls from one LLM response executed at once.
    pub tool_concurrency: usize,
    /// Iterations in a row where every tool call failed before the turn gives up.
    pub max_consecutive_tool_failures: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.switchyard/workspace".into(),
            provider: String::new(),
            model: String::new(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            tool_concurrency: 4,
            max_consecutive_tool_failures: 3,
        }
    }
}

/// Prompt assembly budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    /// Hard ceiling on the assembled prompt, in characters.
    pub max_chars: usize,
    /// Most recent history messages considered for the prompt.
    pub history_turns: usize,
    pub max_memory_entries: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: 48_000,
            history_turns: 50,
            max_memory_entries: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Retained messages per session; oldest are trimmed first.
    pub max_messages: usize,
    /// Retained content characters per session.
    pub max_chars: usize,
    /// Directory for JSONL session files. Empty means `~/.switchyard/sessions`.
    pub dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_chars: 200_000,
            dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentConfig {
    /// Wall-clock budget per subagent, counted from launch.
    pub timeout_secs: u64,
    pub max_iterations: usize,
    pub max_concurrent: usize,
    /// How long finished subagents stay listed.
    pub retention_secs: u64,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_iterations: 15,
            max_concurrent: 8,
            retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Bound of each queue subscribed to the bus. Publishers wait when it is full.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub ollama: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}
