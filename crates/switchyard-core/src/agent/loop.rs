use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use switchyard_config::AgentDefaults;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::context::ContextBuilder;
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::error::AgentError;
use crate::providers::{ChatMessage, ChatRequest, FinishReason, LLMProvider, Usage};
use crate::session::{SessionGuard, SessionManager};
use crate::tools::{ToolContext, ToolRegistry};

const HELP_TEXT: &str = "Commands:\n/new - start a new conversation\n/help - show this help";

const EMPTY_RESPONSE: &str = "I've completed processing but have no response to give.";

/// How long a session lane waits for its next message before retiring.
const DEFAULT_LANE_IDLE: Duration = Duration::from_secs(120);

type LaneReceiver = mpsc::UnboundedReceiver<InboundMessage>;

/// Why a lane worker returned.
enum LaneExit {
    /// Nothing arrived within the idle window. The receiver goes back to the
    /// dispatcher, which retires the lane unless something slipped in.
    Idle(String, LaneReceiver),
    Closed(String),
}

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn preview(s: &str, max: usize) -> String {
    if s.len() > max {
        let end = floor_char_boundary(s, max);
        format!("{}... ({} chars)", &s[..end], s.len())
    } else {
        s.to_string()
    }
}

/// Where a turn currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    BuildingContext,
    AwaitingLlm,
    ExecutingTools,
    Responding,
    Done,
    Failed,
}

/// Model and loop parameters shared by agent turns and subagents.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Requested model; `None` uses the provider's default.
    pub model: Option<String>,
    pub max_iterations: usize,
    pub max_tokens: u64,
    pub temperature: f64,
    pub tool_concurrency: usize,
    /// Iterations in a row with every tool call failing before the turn gives
    /// up. Zero disables the breaker.
    pub max_consecutive_tool_failures: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_defaults(&AgentDefaults::default())
    }
}

impl AgentSettings {
    pub fn from_defaults(defaults: &AgentDefaults) -> Self {
        Self {
            model: Some(defaults.model.clone()).filter(|m| !m.is_empty()),
            max_iterations: defaults.max_tool_iterations,
            max_tokens: u64::from(defaults.max_tokens),
            temperature: f64::from(defaults.temperature),
            tool_concurrency: defaults.tool_concurrency,
            max_consecutive_tool_failures: defaults.max_consecutive_tool_failures,
        }
    }
}

/// What one run of the model/tool loop produced.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub content: String,
    pub tools_used: Vec<String>,
    pub reasoning: Option<String>,
    pub usage: Usage,
    pub iterations: usize,
}

/// Drive the LLM <> tool loop until the model answers without tool calls.
///
/// Every tool failure is fed back to the model as a tool result. Exceeding
/// `max_iterations` LLM calls is an error, never a silent stop.
pub async fn run_tool_loop(
    provider: &dyn LLMProvider,
    tools: &ToolRegistry,
    mut messages: Vec<ChatMessage>,
    settings: &AgentSettings,
    ctx: &ToolContext,
    on_state: &(dyn Fn(TurnState) + Send + Sync),
) -> Result<LoopOutcome, AgentError> {
    let definitions = tools.definitions();
    let mut tools_used = Vec::new();
    let mut reasoning: Vec<String> = Vec::new();
    let mut usage = Usage::default();
    let mut consecutive_failures = 0usize;
    let max = settings.max_iterations;

    for iteration in 1..=max {
        on_state(TurnState::AwaitingLlm);
        debug!(
            "LLM request [{iteration}/{max}]: {} messages, temp={}, max_tokens={}",
            messages.len(),
            settings.temperature,
            settings.max_tokens
        );

        let started = std::time::Instant::now();
        let response = provider
            .chat(ChatRequest {
                messages: messages.clone(),
                tools: definitions.clone(),
                model: settings.model.clone(),
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
            })
            .await?;
        response.validate()?;
        usage.add(&response.usage);
        if let Some(r) = response.reasoning.as_deref().filter(|r| !r.is_empty()) {
            info!("Model reasoning: {r}");
            reasoning.push(r.to_string());
        }

        if !response.has_tool_calls() {
            if response.finish_reason == FinishReason::Length {
                warn!("LLM response truncated at max_tokens={}", settings.max_tokens);
            }
            let content = response
                .content
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| EMPTY_RESPONSE.to_string());
            debug!(
                "LLM response [{iteration}/{max}]: text ({} chars) in {:.1}s",
                content.len(),
                started.elapsed().as_secs_f64()
            );
            return Ok(LoopOutcome {
                content,
                tools_used,
                reasoning: if reasoning.is_empty() {
                    None
                } else {
                    Some(reasoning.join("\n"))
                },
                usage,
                iterations: iteration,
            });
        }

        debug!(
            "LLM response [{iteration}/{max}]: {} tool call(s) in {:.1}s",
            response.tool_calls.len(),
            started.elapsed().as_secs_f64()
        );
        if response.finish_reason != FinishReason::ToolCalls {
            debug!("Tool calls returned with finish_reason {:?}", response.finish_reason);
        }

        on_state(TurnState::ExecutingTools);
        for call in &response.tool_calls {
            info!(
                "Tool call [{iteration}/{max}]: {}({})",
                call.name,
                preview(&call.arguments.to_string(), 200)
            );
            tools_used.push(call.name.clone());
        }
        let outcomes = tools
            .dispatch_all(&response.tool_calls, ctx, settings.tool_concurrency)
            .await;

        messages.push(ChatMessage::Assistant {
            content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
            reasoning: response.reasoning.clone(),
        });

        let mut last_error: Option<(String, AgentError)> = None;
        let mut any_success = false;
        for outcome in outcomes {
            let content = outcome.content();
            debug!("Tool result [{}]: {}", outcome.name, preview(&content, 200));
            messages.push(ChatMessage::tool_result(
                &outcome.call_id,
                &outcome.name,
                content.clone(),
            ));
            match outcome.result {
                Ok(_) => any_success = true,
                Err(e) => last_error = Some((content, e.into())),
            }
        }

        if any_success {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
            let limit = settings.max_consecutive_tool_failures;
            if limit > 0 && consecutive_failures >= limit {
                let (text, kind) = match last_error {
                    Some((text, err)) => (text, err.to_string()),
                    None => (String::new(), "no tool result".to_string()),
                };
                warn!("Circuit breaker: {consecutive_failures} consecutive iterations with all tool calls failing (last: {kind})");
                return Ok(LoopOutcome {
                    content: format!(
                        "I'm having trouble using a tool correctly and had to stop retrying. \
                         Last error: {text}. Could you try rephrasing your request?"
                    ),
                    tools_used,
                    reasoning: None,
                    usage,
                    iterations: iteration,
                });
            }
        }
    }

    warn!("Agent loop reached max iterations ({max}) without final response");
    Err(AgentError::IterationLimit(max))
}

/// A turn whose work is finished but not yet applied to its session.
enum PlannedTurn {
    Reply {
        session: SessionGuard,
        reply: OutboundMessage,
    },
    Reset {
        session: SessionGuard,
        reply: OutboundMessage,
    },
    Completed {
        session: SessionGuard,
        user_record: String,
        outcome: LoopOutcome,
        reply: OutboundMessage,
    },
}

/// Core agent processing loop.
///
/// Messages for the same session are processed strictly in arrival order,
/// one turn at a time; different sessions proceed concurrently. A turn only
/// touches its session after the model has produced the final answer, so a
/// cancelled or failed turn leaves no trace in history.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LLMProvider>,
    sessions: Arc<SessionManager>,
    context: ContextBuilder,
    tools: ToolRegistry,
    settings: AgentSettings,
    states: DashMap<String, TurnState>,
    lane_idle: Duration,
    open_lanes: AtomicUsize,
}

impl AgentLoop {
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LLMProvider>,
        sessions: Arc<SessionManager>,
        context: ContextBuilder,
        tools: ToolRegistry,
        settings: AgentSettings,
    ) -> Self {
        Self {
            bus,
            provider,
            sessions,
            context,
            tools,
            settings,
            states: DashMap::new(),
            lane_idle: DEFAULT_LANE_IDLE,
            open_lanes: AtomicUsize::new(0),
        }
    }

    /// Override how long an idle session lane is kept before it retires.
    pub fn with_lane_idle(mut self, idle: Duration) -> Self {
        self.lane_idle = idle;
        self
    }

    /// Sessions that currently have a lane worker in [`run`](Self::run).
    pub fn open_lanes(&self) -> usize {
        self.open_lanes.load(Ordering::Relaxed)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Last recorded state of the turn for `session_key`.
    pub fn turn_state(&self, session_key: &str) -> Option<TurnState> {
        self.states.get(session_key).map(|s| *s)
    }

    fn set_state(&self, session_key: &str, state: TurnState) {
        let prev = self.states.insert(session_key.to_string(), state);
        debug!("Turn {session_key}: {prev:?} -> {state:?}");
    }

    /// Consume inbound messages until the queue closes or `shutdown` fires.
    ///
    /// Each session gets its own FIFO lane worker, retired once it has been
    /// idle for a while and reopened by the next message. On shutdown,
    /// in-flight turns are cancelled; when the queue simply closes, lanes
    /// finish what they already hold.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Agent loop started ({} inbound subscriber(s))",
            self.bus.inbound_subscribers().await
        );
        let mut lanes: HashMap<String, mpsc::UnboundedSender<InboundMessage>> = HashMap::new();
        let mut workers: JoinSet<LaneExit> = JoinSet::new();

        loop {
            let msg = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(done) = workers.join_next() => {
                    match done {
                        Ok(LaneExit::Idle(key, rx)) if !rx.is_empty() => {
                            // Messages arrived while the worker was stepping down.
                            workers.spawn(self.clone().drive_lane(key, rx, shutdown.child_token()));
                        }
                        Ok(LaneExit::Idle(key, _)) | Ok(LaneExit::Closed(key)) => {
                            lanes.remove(&key);
                            self.states.remove(&key);
                            debug!("Retired lane for session {key}");
                        }
                        // The dead lane's sender fails on the next message and is replaced.
                        Err(e) => error!("Session lane worker panicked: {e}"),
                    }
                    self.open_lanes.store(lanes.len(), Ordering::Relaxed);
                    continue;
                }
                msg = inbound.recv() => match msg {
                    Some(m) => m,
                    None => break,
                },
            };

            let key = msg.routing_key();
            let msg = match lanes.get(&key) {
                Some(tx) => match tx.send(msg) {
                    Ok(()) => continue,
                    Err(mpsc::error::SendError(msg)) => msg,
                },
                None => msg,
            };

            let (tx, rx) = mpsc::unbounded_channel();
            if tx.send(msg).is_err() {
                continue;
            }
            lanes.insert(key.clone(), tx);
            self.open_lanes.store(lanes.len(), Ordering::Relaxed);
            debug!("Opened lane for session {key}");
            workers.spawn(self.clone().drive_lane(key, rx, shutdown.child_token()));
        }

        drop(lanes);
        while let Some(done) = workers.join_next().await {
            if let Err(e) = done {
                error!("Session lane worker panicked: {e}");
            }
        }
        self.open_lanes.store(0, Ordering::Relaxed);
        info!("Agent loop stopped");
    }

    async fn drive_lane(
        self: Arc<Self>,
        key: String,
        mut rx: LaneReceiver,
        cancel: CancellationToken,
    ) -> LaneExit {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.lane_idle, rx.recv()) => match next {
                    Ok(Some(m)) => m,
                    Ok(None) => break,
                    Err(_) => return LaneExit::Idle(key, rx),
                },
            };
            self.handle_inbound(msg, &cancel).await;
        }
        debug!("Lane for session {key} closed");
        LaneExit::Closed(key)
    }

    /// Process one message and publish the reply or a failure notice.
    async fn handle_inbound(&self, msg: InboundMessage, cancel: &CancellationToken) {
        let preview_text = preview(&msg.content, 80);
        info!(
            "Processing message from {}:{}: {preview_text}",
            msg.channel, msg.sender_id
        );

        let reply = match self.process_message_cancellable(&msg, cancel).await {
            Ok(reply) => reply,
            Err(AgentError::Cancelled) => {
                info!("Turn for {} cancelled", msg.routing_key());
                return;
            }
            Err(e) if e.is_provider_failure() => {
                // Not retried here; the user has to send the message again.
                warn!("Model call for {} failed: {e}", msg.routing_key());
                OutboundMessage::reply(&msg, &format!("Sorry, I encountered an error: {e}"))
            }
            Err(e) => {
                error!("Turn for {} failed: {e}", msg.routing_key());
                OutboundMessage::reply(&msg, &format!("Sorry, I encountered an error: {e}"))
            }
        };

        if let Err(e) = self.bus.publish_outbound(reply).await {
            warn!("Could not publish response for {}: {e}", msg.routing_key());
        }
    }

    /// Run one turn to completion and return the reply.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage, AgentError> {
        self.process_message_cancellable(msg, &CancellationToken::new())
            .await
    }

    /// Run one turn; if `cancel` fires before the answer is ready, the turn is
    /// abandoned and the session is left exactly as it was.
    pub async fn process_message_cancellable(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, AgentError> {
        let key = msg.routing_key();
        self.process_keyed(msg, &key, cancel).await
    }

    async fn process_keyed(
        &self,
        msg: &InboundMessage,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<OutboundMessage, AgentError> {
        self.set_state(key, TurnState::Idle);
        let planned = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            planned = self.plan_turn(msg, key) => planned,
        };
        match planned {
            Ok(planned) => Ok(self.commit(key, planned).await),
            Err(e) => {
                self.set_state(key, TurnState::Failed);
                Err(e)
            }
        }
    }

    /// Everything up to, but not including, touching the session.
    async fn plan_turn(&self, msg: &InboundMessage, key: &str) -> Result<PlannedTurn, AgentError> {
        let (channel, chat_id) = msg.origin();
        let session = self.sessions.lock(key).await?;
        self.set_state(key, TurnState::BuildingContext);

        if !msg.is_system() {
            match msg.content.trim() {
                "/new" => {
                    return Ok(PlannedTurn::Reset {
                        session,
                        reply: OutboundMessage::reply(msg, "New session started."),
                    })
                }
                "/help" => {
                    return Ok(PlannedTurn::Reply {
                        session,
                        reply: OutboundMessage::reply(msg, HELP_TEXT),
                    })
                }
                _ => {}
            }
        }

        let user_record = if msg.is_system() {
            format!("[System: {}] {}", msg.sender_id, msg.content)
        } else {
            msg.content.clone()
        };

        let history = session
            .get_history(self.context.budget().history_turns)
            .to_vec();
        let prompt = self.context.build(
            &history,
            &user_record,
            &msg.media,
            Some(&channel),
            Some(&chat_id),
        )?;
        debug!(
            "Context for {key}: {} messages, {} chars (dropped {} history, {} memory)",
            prompt.messages.len(),
            prompt.char_len(),
            prompt.dropped_history,
            prompt.dropped_memory
        );

        let ctx = ToolContext::new(&channel, &chat_id);
        let on_state = |state: TurnState| self.set_state(key, state);
        let outcome = run_tool_loop(
            self.provider.as_ref(),
            &self.tools,
            prompt.messages,
            &self.settings,
            &ctx,
            &on_state,
        )
        .await?;

        Ok(PlannedTurn::Completed {
            session,
            user_record,
            reply: OutboundMessage::reply(msg, &outcome.content),
            outcome,
        })
    }

    /// Apply a finished turn to its session. Not cancellable.
    async fn commit(&self, key: &str, planned: PlannedTurn) -> OutboundMessage {
        self.set_state(key, TurnState::Responding);
        let reply = match planned {
            PlannedTurn::Reply { reply, .. } => reply,
            PlannedTurn::Reset { mut session, reply } => {
                self.archive(&session);
                session.clear();
                self.persist(&session).await;
                reply
            }
            PlannedTurn::Completed {
                mut session,
                user_record,
                outcome,
                reply,
            } => {
                session.add_message("user", &user_record);
                session.add_message_with_tools("assistant", &outcome.content, outcome.tools_used);
                self.sessions.apply_limits(&mut session);
                self.persist(&session).await;
                info!(
                    "Turn for {key} done: {} iteration(s), {} tokens ({} in / {} out)",
                    outcome.iterations,
                    outcome.usage.total_tokens,
                    outcome.usage.prompt_tokens,
                    outcome.usage.completion_tokens
                );
                reply
            }
        };
        self.set_state(key, TurnState::Done);
        reply
    }

    /// A failed save leaves the in-memory session intact for the next turn.
    async fn persist(&self, session: &SessionGuard) {
        if let Err(e) = self.sessions.save(session).await {
            error!("Failed to save session {}: {e}", session.key);
        }
    }

    /// Leave a one-line trace of a conversation being cleared.
    fn archive(&self, session: &SessionGuard) {
        if session.messages.is_empty() {
            return;
        }
        let last_user = session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| preview(&m.content, 120))
            .unwrap_or_default();
        let entry = format!(
            "[{}] {} cleared after {} messages. Last request: {last_user}",
            chrono::Local::now().format("%Y-%m-%d %H:%M"),
            session.key,
            session.messages.len()
        );
        if let Err(e) = self.context.memory().append_history(&entry) {
            warn!("Failed to append to history log: {e:#}");
        }
    }

    /// Run one turn outside the bus, e.g. from the CLI.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<String, AgentError> {
        let msg = InboundMessage::new(channel, "user", chat_id, content);
        let reply = self
            .process_keyed(&msg, session_key, &CancellationToken::new())
            .await?;
        Ok(reply.content)
    }
}
