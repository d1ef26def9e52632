use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::agent::memory::{MemoryEntry, MemoryStore};
use crate::agent::skills::SkillsLoader;
use crate::error::AgentError;
use crate::providers::ChatMessage;
use crate::session::Message;

/// Bootstrap files loaded into the system prompt.
const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

const SECTION_BREAK: &str = "\n\n---\n\n";

fn chars(s: &str) -> usize {
    s.chars().count()
}

/// Size limits for one assembled prompt.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    /// Ceiling on the total characters of all prompt messages.
    pub max_chars: usize,
    /// Most recent session messages eligible for inclusion.
    pub history_turns: usize,
    pub max_memory_entries: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_chars: 48_000,
            history_turns: 50,
            max_memory_entries: 8,
        }
    }
}

/// Prompt ready for a provider, plus what had to be left out to fit.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub messages: Vec<ChatMessage>,
    /// History messages dropped to satisfy the budget.
    pub dropped_history: usize,
    /// Memory entries dropped to satisfy the budget.
    pub dropped_memory: usize,
}

impl PromptContext {
    pub fn char_len(&self) -> usize {
        self.messages.iter().map(ChatMessage::char_len).sum()
    }

    pub fn system_prompt(&self) -> &str {
        match self.messages.first() {
            Some(ChatMessage::System { content }) => content,
            _ => "",
        }
    }
}

/// Builds the system prompt and message list for LLM calls.
///
/// The fixed part of the prompt (identity, bootstrap files, skills, session
/// info) and the current message are never truncated. When the total exceeds
/// the budget, the oldest history goes first, then the lowest-ranked memory.
/// If the fixed part alone does not fit, building fails.
pub struct ContextBuilder {
    workspace: PathBuf,
    memory: MemoryStore,
    skills: SkillsLoader,
    identity_override: Option<String>,
    budget: ContextBudget,
}

impl ContextBuilder {
    pub fn new(
        workspace: &Path,
        shared_skills: Option<&Path>,
        budget: ContextBudget,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            workspace: workspace.to_path_buf(),
            memory: MemoryStore::new(workspace),
            skills: SkillsLoader::new(workspace, shared_skills)?,
            identity_override: None,
            budget,
        })
    }

    /// Replace the built-in identity section.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity_override = Some(identity.into());
        self
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn skills(&self) -> &SkillsLoader {
        &self.skills
    }

    fn identity(&self) -> String {
        if let Some(identity) = &self.identity_override {
            return identity.clone();
        }
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let tz = chrono::Local::now().format("%Z");
        let workspace_path = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone())
            .display()
            .to_string();

        format!(
            r#"# Switchyard

You are a helpful AI assistant reachable from several chat channels. You can:
- Delegate long-running work to a background subagent with the 'spawn' tool
- Send a message to a chat with the 'message' tool

## Current Time
{now} ({tz})

## Workspace
Your workspace is at: {workspace_path}
- Long-term memory: {workspace_path}/memory/MEMORY.md
- History log: {workspace_path}/memory/HISTORY.md
- Custom skills: {workspace_path}/skills/{{skill-name}}/SKILL.md

When answering the user directly, reply with text. Only use the 'message' tool to
reach a different chat or to send progress while you keep working.

Subagent reports arrive as messages starting with "[System: subagent]". Summarize
them for the user in plain language instead of repeating them verbatim."#
        )
    }

    fn bootstrap(&self) -> String {
        BOOTSTRAP_FILES
            .iter()
            .filter_map(|name| {
                std::fs::read_to_string(self.workspace.join(name))
                    .ok()
                    .map(|content| format!("## {name}\n\n{content}"))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn skills_block(&self) -> Vec<String> {
        let mut parts = Vec::new();
        let always = self.skills.get_always_skills();
        if !always.is_empty() {
            let content = self.skills.load_skills_for_context(&always);
            if !content.is_empty() {
                parts.push(format!("# Active Skills\n\n{content}"));
            }
        }
        let summary = self.skills.build_skills_summary();
        if !summary.is_empty() {
            parts.push(format!(
                "# Skills\n\nThe following skills extend your capabilities. \
                 Skills marked [needs: ...] require dependencies first.\n\n{summary}"
            ));
        }
        parts
    }

    /// Identity, bootstrap files, skills and session info. Never truncated.
    pub fn fixed_prompt(&self, channel: Option<&str>, chat_id: Option<&str>) -> String {
        let mut parts = vec![self.identity()];
        let bootstrap = self.bootstrap();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }
        parts.extend(self.skills_block());

        let mut prompt = parts.join(SECTION_BREAK);
        if let (Some(ch), Some(cid)) = (channel, chat_id) {
            prompt.push_str(&format!("\n\n## Current Session\nChannel: {ch}\nChat ID: {cid}"));
        }
        prompt
    }

    fn memory_section(entries: &[MemoryEntry]) -> String {
        if entries.is_empty() {
            return String::new();
        }
        let body = entries
            .iter()
            .map(|e| format!("- {}", e.text))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{SECTION_BREAK}# Memory\n\n{body}")
    }

    fn user_content(current: &str, media: &[String]) -> String {
        if media.is_empty() {
            current.to_string()
        } else {
            format!("{current}\n\n[Attached media: {}]", media.join(", "))
        }
    }

    fn history_message(msg: &Message) -> ChatMessage {
        match msg.role.as_str() {
            "assistant" => ChatMessage::assistant(msg.content.clone()),
            _ => ChatMessage::user(msg.content.clone()),
        }
    }

    /// Assemble `[system, history.., user]` within the budget.
    pub fn build(
        &self,
        history: &[Message],
        current: &str,
        media: &[String],
        channel: Option<&str>,
        chat_id: Option<&str>,
    ) -> Result<PromptContext, AgentError> {
        let max = self.budget.max_chars;
        let fixed = self.fixed_prompt(channel, chat_id);
        let user = Self::user_content(current, media);
        let fixed_len = chars(&fixed) + chars(&user);
        if fixed_len > max {
            return Err(AgentError::ContextBudgetExceeded(format!(
                "system prompt and current message need {fixed_len} chars, budget is {max}"
            )));
        }

        let mut memory = match self.memory.retrieve(current, self.budget.max_memory_entries) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Memory retrieval failed, continuing without it: {e:#}");
                Vec::new()
            }
        };
        let retrieved = memory.len();

        let window = &history[history.len().saturating_sub(self.budget.history_turns)..];
        let mut start = 0;
        let mut history_len: usize = window.iter().map(Message::char_len).sum();

        loop {
            let total = fixed_len + chars(&Self::memory_section(&memory)) + history_len;
            if total <= max {
                break;
            }
            if start < window.len() {
                history_len -= window[start].char_len();
                start += 1;
            } else if memory.pop().is_none() {
                // Unreachable while fixed_len <= max; guard against looping forever.
                return Err(AgentError::ContextBudgetExceeded(format!(
                    "prompt needs {total} chars, budget is {max}"
                )));
            }
        }

        let kept = &window[start..];
        let mut messages = Vec::with_capacity(kept.len() + 2);
        messages.push(ChatMessage::system(format!(
            "{fixed}{}",
            Self::memory_section(&memory)
        )));
        messages.extend(kept.iter().map(Self::history_message));
        messages.push(ChatMessage::user(user));

        let ctx = PromptContext {
            messages,
            dropped_history: start,
            dropped_memory: retrieved - memory.len(),
        };
        if ctx.dropped_history > 0 || ctx.dropped_memory > 0 {
            debug!(
                "Prompt over budget: dropped {} history message(s), {} memory entr(ies); {} / {max} chars",
                ctx.dropped_history,
                ctx.dropped_memory,
                ctx.char_len()
            );
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn write_skill(workspace: &Path, name: &str, body: &str) {
        let dir = workspace.join("skills").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: test\nalways: true\n---\n{body}"),
        )
        .unwrap();
    }

    fn builder(workspace: &Path, budget: ContextBudget) -> ContextBuilder {
        ContextBuilder::new(workspace, None, budget)
            .unwrap()
            .with_identity("# Test identity")
    }

    fn history(n: usize, each: usize) -> Vec<Message> {
        let mut s = Session::new("cli:1");
        for i in 0..n {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            s.add_message(role, &format!("{i:03}{}", "x".repeat(each.saturating_sub(3))));
        }
        s.messages
    }

    #[test]
    fn fifty_turns_trimmed_to_window_with_skills_intact() {
        let ws = tempfile::tempdir().unwrap();
        write_skill(ws.path(), "house-style", "Always answer in haiku.");
        let ctx = builder(
            ws.path(),
            ContextBudget {
                max_chars: 100_000,
                history_turns: 10,
                max_memory_entries: 4,
            },
        )
        .build(&history(50, 20), "hello", &[], Some("cli"), Some("1"))
        .unwrap();

        // system + 10 history + current
        assert_eq!(ctx.messages.len(), 12);
        assert!(ctx.messages[1].text().unwrap().starts_with("040"));
        assert!(ctx.messages[10].text().unwrap().starts_with("049"));
        assert!(ctx.system_prompt().contains("Always answer in haiku."));
        assert!(ctx.system_prompt().contains("Chat ID: 1"));
        assert_eq!(ctx.dropped_history, 0);
    }

    #[test]
    fn budget_drops_oldest_history_before_memory() {
        let ws = tempfile::tempdir().unwrap();
        write_skill(ws.path(), "style", "Be brief.");
        let b = builder(ws.path(), ContextBudget::default());
        b.memory()
            .write_long_term("The deploy key lives in the vault.")
            .unwrap();

        let fixed = chars(&b.fixed_prompt(None, None)) + chars("deploy status?");
        let memory_len = chars(&ContextBuilder::memory_section(
            &b.memory().retrieve("deploy status?", 8).unwrap(),
        ));
        // Room for memory and exactly three 100-char history messages.
        let budget = ContextBudget {
            max_chars: fixed + memory_len + 300,
            history_turns: 50,
            max_memory_entries: 8,
        };
        let ctx = builder(ws.path(), budget)
            .build(&history(10, 100), "deploy status?", &[], None, None)
            .unwrap();

        assert!(ctx.char_len() <= budget.max_chars);
        assert_eq!(ctx.dropped_history, 7);
        assert_eq!(ctx.dropped_memory, 0);
        assert!(ctx.system_prompt().contains("Be brief."));
        assert!(ctx.system_prompt().contains("deploy key"));
        assert!(ctx.messages[1].text().unwrap().starts_with("007"));
    }

    #[test]
    fn memory_dropped_once_history_is_gone() {
        let ws = tempfile::tempdir().unwrap();
        let b = builder(ws.path(), ContextBudget::default());
        b.memory().write_long_term("A fact about deploys.").unwrap();
        let fixed = chars(&b.fixed_prompt(None, None)) + chars("deploys");

        let budget = ContextBudget {
            max_chars: fixed + 5,
            history_turns: 50,
            max_memory_entries: 8,
        };
        let ctx = builder(ws.path(), budget)
            .build(&history(4, 50), "deploys", &[], None, None)
            .unwrap();
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.dropped_history, 4);
        assert_eq!(ctx.dropped_memory, 1);
        assert!(ctx.char_len() <= budget.max_chars);
    }

    #[test]
    fn oversized_fixed_prompt_is_a_budget_error() {
        let ws = tempfile::tempdir().unwrap();
        write_skill(ws.path(), "huge", &"s".repeat(2_000));
        let err = builder(
            ws.path(),
            ContextBudget {
                max_chars: 500,
                history_turns: 10,
                max_memory_entries: 0,
            },
        )
        .build(&[], "hi", &[], None, None)
        .unwrap_err();
        assert!(matches!(err, AgentError::ContextBudgetExceeded(_)));
    }

    #[test]
    fn bootstrap_files_and_media_included() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("SOUL.md"), "Be kind.").unwrap();
        let ctx = builder(ws.path(), ContextBudget::default())
            .build(&[], "look", &["/tmp/a.png".into()], None, None)
            .unwrap();
        assert!(ctx.system_prompt().contains("## SOUL.md\n\nBe kind."));
        assert_eq!(
            ctx.messages.last().unwrap().text(),
            Some("look\n\n[Attached media: /tmp/a.png]")
        );
    }

    #[test]
    fn default_identity_mentions_spawn() {
        let ws = tempfile::tempdir().unwrap();
        let b = ContextBuilder::new(ws.path(), None, ContextBudget::default()).unwrap();
        assert!(b.fixed_prompt(None, None).contains("'spawn'"));
    }
}
