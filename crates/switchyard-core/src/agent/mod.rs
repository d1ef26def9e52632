pub mod context;
pub mod r#loop;
pub mod memory;
pub mod skills;
pub mod subagent;

pub use context::{ContextBudget, ContextBuilder, PromptContext};
pub use memory::MemoryStore;
pub use r#loop::{run_tool_loop, AgentLoop, AgentSettings, LoopOutcome, TurnState};
pub use skills::SkillsLoader;
pub use subagent::{Subagent, SubagentManager, SubagentSettings, SubagentStatus};
