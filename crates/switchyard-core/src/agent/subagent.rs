use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use switchyard_config::{AgentDefaults, SubagentConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::r#loop::{run_tool_loop, AgentSettings};
use crate::bus::{InboundMessage, MessageBus};
use crate::error::AgentError;
use crate::providers::{ChatMessage, LLMProvider};
use crate::session::Session;
use crate::tools::{ToolContext, ToolRegistry};

/// Tools a subagent never gets: it cannot nest or talk to the user directly.
pub const SUBAGENT_EXCLUDED_TOOLS: &[&str] = &["spawn", "message"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl SubagentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    fn report_phrase(self) -> &'static str {
        match self {
            Self::Completed => "completed successfully",
            Self::TimedOut => "timed out",
            _ => "failed",
        }
    }
}

impl std::fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one background task.
#[derive(Debug, Clone)]
pub struct Subagent {
    pub id: String,
    pub task: String,
    pub label: String,
    pub origin_channel: String,
    pub origin_chat_id: String,
    pub status: SubagentStatus,
    /// Final answer, or the failure reason once the subagent has stopped.
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SubagentSettings {
    pub timeout: Duration,
    pub max_iterations: usize,
    pub max_concurrent: usize,
    /// Finished records older than this are dropped on the next launch.
    pub retention: Duration,
    pub agent: AgentSettings,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self::from_config(&SubagentConfig::default(), &AgentDefaults::default())
    }
}

impl SubagentSettings {
    pub fn from_config(config: &SubagentConfig, defaults: &AgentDefaults) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_iterations: config.max_iterations,
            max_concurrent: config.max_concurrent.max(1),
            retention: Duration::from_secs(config.retention_secs),
            agent: AgentSettings::from_defaults(defaults),
        }
    }
}

/// How a subagent run ended, before it is turned into a report.
enum Finish {
    Done(String),
    Failed(String),
    TimedOut(String),
}

/// Runs background agent tasks and feeds their results back into the
/// conversation that asked for them.
///
/// Every spawned subagent publishes exactly one report, whatever happens to
/// it. Subagents are not tied to the turn that spawned them; only
/// [`cancel`](Self::cancel) and [`shutdown`](Self::shutdown) stop them early.
pub struct SubagentManager {
    provider: Arc<dyn LLMProvider>,
    tools: ToolRegistry,
    bus: Arc<MessageBus>,
    workspace: PathBuf,
    settings: SubagentSettings,
    records: Arc<DashMap<String, Subagent>>,
    tokens: Arc<DashMap<String, CancellationToken>>,
    slots: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl SubagentManager {
    /// `tools` is the parent's registry; tools in [`SUBAGENT_EXCLUDED_TOOLS`]
    /// are removed from it.
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        tools: &ToolRegistry,
        bus: Arc<MessageBus>,
        workspace: PathBuf,
        settings: SubagentSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            provider,
            tools: tools.without(SUBAGENT_EXCLUDED_TOOLS),
            bus,
            workspace,
            settings,
            records: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            slots,
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start a subagent and return the acknowledgement shown to the model.
    pub fn spawn(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> String {
        let (id, label) = self.launch(task, label, origin_channel, origin_chat_id);
        format!("Subagent [{label}] started (id: {id}). I'll notify you when it completes.")
    }

    /// Start a subagent and return its id and display label.
    pub fn launch(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
    ) -> (String, String) {
        self.prune(self.settings.retention);
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let label = match label {
            Some(l) => l.to_string(),
            None => default_label(task),
        };

        let record = Subagent {
            id: id.clone(),
            task: task.to_string(),
            label: label.clone(),
            origin_channel: origin_channel.to_string(),
            origin_chat_id: origin_chat_id.to_string(),
            status: SubagentStatus::Pending,
            result: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.records.insert(id.clone(), record.clone());

        let cancel = self.shutdown.child_token();
        self.tokens.insert(id.clone(), cancel.clone());

        let worker = Worker {
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            bus: self.bus.clone(),
            records: self.records.clone(),
            tokens: self.tokens.clone(),
            slots: self.slots.clone(),
            settings: self.settings.clone(),
            prompt: self.system_prompt(),
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!("Subagent supervisor panicked: {e}");
            }
        }
        tasks.spawn(worker.supervise(record, cancel));

        info!("Spawned subagent [{id}]: {label}");
        (id, label)
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a focused background worker agent (subagent). \
             Your workspace is: {}\n\n\
             Rules:\n\
             - Work ONLY on the task you were given\n\
             - Do not start conversations or ask questions; nobody will answer\n\
             - Be concise but thorough\n\
             - Finish with a clear summary of what you found or did",
            self.workspace.display()
        )
    }

    pub fn status(&self, id: &str) -> Option<SubagentStatus> {
        self.records.get(id).map(|r| r.status)
    }

    pub fn get(&self, id: &str) -> Option<Subagent> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All known subagents, oldest first.
    pub fn list(&self) -> Vec<Subagent> {
        let mut all: Vec<Subagent> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Subagents that have not finished yet, including queued ones.
    pub fn running_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// Forget finished subagents that ended more than `older_than` ago.
    /// Returns how many records were removed.
    pub fn prune(&self, older_than: Duration) -> usize {
        let keep = chrono::Duration::from_std(older_than)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now() - keep;
        let mut removed = 0;
        self.records.retain(|_, r| {
            let expired = r.status.is_terminal() && r.finished_at.is_some_and(|t| t <= cutoff);
            removed += usize::from(expired);
            !expired
        });
        if removed > 0 {
            debug!("Pruned {removed} finished subagent record(s)");
        }
        removed
    }

    /// Stop a subagent. It still reports back, as failed.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.cancel();
                info!("Cancelled subagent {id}");
                true
            }
            None => false,
        }
    }

    /// Cancel every subagent and wait for their reports to go out.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("Subagent supervisor panicked: {e}");
            }
        }
        debug!("Subagent manager shut down");
    }
}

/// Everything one subagent needs once it is detached from the manager.
struct Worker {
    provider: Arc<dyn LLMProvider>,
    tools: ToolRegistry,
    bus: Arc<MessageBus>,
    records: Arc<DashMap<String, Subagent>>,
    tokens: Arc<DashMap<String, CancellationToken>>,
    slots: Arc<Semaphore>,
    settings: SubagentSettings,
    prompt: String,
}

impl Worker {
    async fn supervise(self, record: Subagent, cancel: CancellationToken) {
        let id = record.id.clone();
        let finish = self.run(&record, &cancel).await;

        let (status, result) = match finish {
            Finish::Done(text) => (SubagentStatus::Completed, text),
            Finish::Failed(reason) => (SubagentStatus::Failed, reason),
            Finish::TimedOut(reason) => (SubagentStatus::TimedOut, reason),
        };
        match status {
            SubagentStatus::Completed => info!("Subagent [{id}] completed successfully"),
            _ => warn!("Subagent [{id}] {status}: {result}"),
        }

        // The record reaches its terminal state before the report is visible.
        if let Some(mut r) = self.records.get_mut(&id) {
            r.status = status;
            r.result = Some(result.clone());
            r.finished_at = Some(Utc::now());
        }
        self.tokens.remove(&id);

        let mut msg = InboundMessage::system(
            "subagent",
            &record.origin_channel,
            &record.origin_chat_id,
            &report(&record.label, &record.task, status, &result),
        );
        msg.metadata.insert("subagent_id".into(), id.clone().into());
        msg.metadata.insert("status".into(), status.as_str().into());
        msg.metadata.insert("label".into(), record.label.clone().into());

        match self.bus.publish_inbound(msg).await {
            Ok(()) => debug!(
                "Subagent [{id}] reported to {}:{}",
                record.origin_channel, record.origin_chat_id
            ),
            Err(e) => error!("Subagent [{id}] could not publish its report: {e}"),
        }
    }

    fn timed_out(&self, id: &str) -> Finish {
        Finish::TimedOut(
            AgentError::SubagentTimeout {
                id: id.to_string(),
                after: self.settings.timeout,
            }
            .to_string(),
        )
    }

    /// The deadline counts from launch, so time spent queued for a slot is
    /// part of the budget.
    async fn run(&self, record: &Subagent, cancel: &CancellationToken) -> Finish {
        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        let queued = tokio::time::timeout_at(deadline, self.slots.clone().acquire_owned());
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Finish::Failed("Error: cancelled before it started".into()),
            permit = queued => match permit {
                Ok(Ok(p)) => p,
                Ok(Err(_)) => return Finish::Failed("Error: subagent pool closed".into()),
                Err(_) => {
                    debug!("Subagent [{}] never got a slot", record.id);
                    return self.timed_out(&record.id);
                }
            },
        };
        if let Some(mut r) = self.records.get_mut(&record.id) {
            r.status = SubagentStatus::Running;
        }

        let job = tokio::spawn(execute(
            self.provider.clone(),
            self.tools.clone(),
            self.settings.clone(),
            self.prompt.clone(),
            record.id.clone(),
            record.task.clone(),
        ));
        let abort = job.abort_handle();

        let finish = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort.abort();
                Finish::Failed("Error: cancelled".into())
            }
            joined = tokio::time::timeout_at(deadline, job) => match joined {
                Err(_) => {
                    abort.abort();
                    self.timed_out(&record.id)
                }
                Ok(Err(e)) if e.is_panic() => Finish::Failed("Error: subagent panicked".into()),
                Ok(Err(_)) => Finish::Failed("Error: cancelled".into()),
                Ok(Ok(Ok(text))) => Finish::Done(text),
                Ok(Ok(Err(AgentError::IterationLimit(n)))) => Finish::TimedOut(format!(
                    "Stopped after {n} iterations without finishing the task"
                )),
                Ok(Ok(Err(e))) => Finish::Failed(format!("Error: {e}")),
            },
        };
        drop(permit);
        finish
    }
}

/// The subagent's own conversation: seeded with the task, never shared.
async fn execute(
    provider: Arc<dyn LLMProvider>,
    tools: ToolRegistry,
    settings: SubagentSettings,
    prompt: String,
    id: String,
    task: String,
) -> Result<String, AgentError> {
    let mut session = Session::new(format!("subagent:{id}"));
    session.add_message("user", &task);

    let mut messages = vec![ChatMessage::system(prompt)];
    messages.extend(session.messages.iter().map(|m| ChatMessage::user(m.content.clone())));

    let agent = AgentSettings {
        max_iterations: settings.max_iterations,
        ..settings.agent
    };
    let ctx = ToolContext::new("subagent", &id);
    let outcome = run_tool_loop(provider.as_ref(), &tools, messages, &agent, &ctx, &|_| {}).await?;

    session.add_message_with_tools("assistant", &outcome.content, outcome.tools_used);
    debug!(
        "Subagent [{id}] finished in {} iteration(s), {} messages",
        outcome.iterations,
        session.messages.len()
    );
    Ok(outcome.content)
}

fn default_label(task: &str) -> String {
    let mut chars = task.chars();
    let head: String = chars.by_ref().take(30).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn report(label: &str, task: &str, status: SubagentStatus, result: &str) -> String {
    format!(
        "[Subagent '{label}' {}]\n\nTask: {task}\n\nResult:\n{result}\n\n\
         Summarize this naturally for the user. Keep it brief (1-2 sentences). \
         Do not mention technical details like \"subagent\" or task IDs.",
        status.report_phrase()
    )
}
