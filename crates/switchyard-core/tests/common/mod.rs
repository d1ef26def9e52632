#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};
use switchyard_core::agent::{AgentSettings, ContextBudget, ContextBuilder};
use switchyard_core::bus::{InboundMessage, OutboundMessage};
use switchyard_core::providers::{
    ChatMessage, ChatRequest, LLMProvider, LLMResponse, ProviderError, ToolCallRequest,
};
use switchyard_core::session::SessionManager;
use switchyard_core::tools::{Tool, ToolContext, ToolRegistry};
use switchyard_core::{AgentLoop, MessageBus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub enum Step {
    Reply(LLMResponse),
    Fail(ProviderError),
    Slow(Duration, LLMResponse),
}

/// Provider that plays back canned steps and echoes the last user message
/// once the script runs out.
#[derive(Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatRequest>>,
    echo_delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    pub fn echo() -> Self {
        Self::default()
    }

    pub fn slow_echo(delay: Duration) -> Self {
        Self {
            echo_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Highest number of `chat` calls that were in flight at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

fn last_user_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ChatMessage::User { content } => Some(content.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, ProviderError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let echo = format!("echo: {}", last_user_text(&request));
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front();

        let result = match step {
            Some(Step::Reply(r)) => Ok(r),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Slow(delay, r)) => {
                tokio::time::sleep(delay).await;
                Ok(r)
            }
            None => {
                if let Some(delay) = self.echo_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(LLMResponse::text(echo))
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

/// Provider that asks for a tool on every call and never answers.
pub struct LoopingProvider;

#[async_trait]
impl LLMProvider for LoopingProvider {
    async fn chat(&self, request: ChatRequest) -> Result<LLMResponse, ProviderError> {
        let id = format!("call-{}", request.messages.len());
        Ok(LLMResponse::tool_calls(vec![ToolCallRequest::new(
            id,
            "whereami",
            json!({}),
        )]))
    }

    fn default_model(&self) -> &str {
        "looping"
    }
}

pub fn call(id: &str, name: &str, args: Value) -> LLMResponse {
    LLMResponse::tool_calls(vec![ToolCallRequest::new(id, name, args)])
}

/// Tool that always succeeds.
pub struct WhereamiTool;

#[async_trait]
impl Tool for WhereamiTool {
    fn name(&self) -> &str {
        "whereami"
    }
    fn description(&self) -> &str {
        "Returns ok"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _params: Value, ctx: &ToolContext) -> anyhow::Result<String> {
        Ok(format!("ok from {}", ctx.session_key()))
    }
}

/// Tool whose execution always fails.
pub struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
        bail!("disk on fire")
    }
}

pub fn context(workspace: &Path) -> ContextBuilder {
    ContextBuilder::new(workspace, None, ContextBudget::default())
        .unwrap()
        .with_identity("You are a test assistant.")
}

pub fn settings() -> AgentSettings {
    AgentSettings {
        max_iterations: 5,
        ..AgentSettings::default()
    }
}

pub struct Harness {
    pub bus: Arc<MessageBus>,
    pub sessions: Arc<SessionManager>,
    pub agent: Arc<AgentLoop>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub shutdown: CancellationToken,
    pub workspace: tempfile::TempDir,
}

impl Harness {
    pub async fn build(
        provider: Arc<dyn LLMProvider>,
        tools: impl FnOnce(&Arc<MessageBus>, &Path) -> ToolRegistry,
        settings: AgentSettings,
    ) -> Self {
        Self::assemble(provider, tools, settings, Arc::new(SessionManager::in_memory()), None).await
    }

    /// Harness whose sessions live in `sessions` instead of memory.
    pub async fn with_sessions(provider: Arc<dyn LLMProvider>, sessions: SessionManager) -> Self {
        Self::assemble(provider, no_tools, settings(), Arc::new(sessions), None).await
    }

    /// Harness whose session lanes retire after `idle`.
    pub async fn with_lane_idle(provider: Arc<dyn LLMProvider>, idle: Duration) -> Self {
        let sessions = Arc::new(SessionManager::in_memory());
        Self::assemble(provider, no_tools, settings(), sessions, Some(idle)).await
    }

    async fn assemble(
        provider: Arc<dyn LLMProvider>,
        tools: impl FnOnce(&Arc<MessageBus>, &Path) -> ToolRegistry,
        settings: AgentSettings,
        sessions: Arc<SessionManager>,
        lane_idle: Option<Duration>,
    ) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(64));
        let registry = tools(&bus, workspace.path());
        let mut agent = AgentLoop::new(
            bus.clone(),
            provider,
            sessions.clone(),
            context(workspace.path()),
            registry,
            settings,
        );
        if let Some(idle) = lane_idle {
            agent = agent.with_lane_idle(idle);
        }
        let agent = Arc::new(agent);
        let outbound = bus.outbound_queue().await;
        Self {
            bus,
            sessions,
            agent,
            outbound,
            shutdown: CancellationToken::new(),
            workspace,
        }
    }

    /// Start the dispatcher on the bus's inbound queue.
    pub async fn start(&self) -> tokio::task::JoinHandle<()> {
        let inbound = self.bus.inbound_queue().await;
        tokio::spawn(self.agent.clone().run(inbound, self.shutdown.clone()))
    }

    pub async fn send(&self, chat_id: &str, content: &str) {
        self.bus
            .publish_inbound(InboundMessage::new("cli", "user", chat_id, content))
            .await
            .unwrap();
    }

    pub async fn next_reply(&mut self) -> OutboundMessage {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("outbound queue closed")
    }

    /// (role, content) pairs currently stored for `key`.
    pub async fn history(&self, key: &str) -> Vec<(String, String)> {
        let session = self.sessions.lock(key).await.unwrap();
        session
            .messages
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect()
    }
}

pub fn no_tools(_: &Arc<MessageBus>, _: &Path) -> ToolRegistry {
    ToolRegistry::new()
}
