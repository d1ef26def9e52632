mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchyard_core::agent::{AgentSettings, SubagentSettings, SubagentStatus};
use switchyard_core::bus::{InboundMessage, MessageBus, OutboundMessage};
use switchyard_core::providers::{LLMProvider, LLMResponse, ProviderError};
use switchyard_core::tools::message::MessageTool;
use switchyard_core::tools::spawn::SpawnTool;
use switchyard_core::tools::ToolRegistry;
use switchyard_core::{AgentLoop, SessionManager, SubagentManager};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::*;

fn subagent_settings(timeout: Duration) -> SubagentSettings {
    SubagentSettings {
        timeout,
        max_iterations: 4,
        max_concurrent: 4,
        retention: Duration::from_secs(3600),
        agent: AgentSettings::default(),
    }
}

fn manager(
    provider: Arc<dyn LLMProvider>,
    bus: &Arc<MessageBus>,
    settings: SubagentSettings,
) -> SubagentManager {
    let mut parent_tools = ToolRegistry::new();
    parent_tools.register(Arc::new(WhereamiTool));
    parent_tools.register(Arc::new(MessageTool::new(bus.clone())));
    SubagentManager::new(
        provider,
        &parent_tools,
        bus.clone(),
        std::env::temp_dir(),
        settings,
    )
}

async fn next_report(rx: &mut mpsc::Receiver<InboundMessage>) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no report within timeout")
        .expect("inbound queue closed")
}

async fn next_outbound(rx: &mut mpsc::Receiver<OutboundMessage>) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no reply within timeout")
        .expect("outbound queue closed")
}

async fn assert_no_more(rx: &mut mpsc::Receiver<InboundMessage>) {
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected second report");
}

#[tokio::test]
async fn successful_subagent_reports_once_to_origin() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::new(vec![Step::Reply(LLMResponse::text(
        "X has 3 results",
    ))]));
    let mgr = manager(provider.clone(), &bus, subagent_settings(Duration::from_secs(5)));

    let ack = mgr.spawn("search X", None, "telegram", "7");
    assert!(ack.starts_with("Subagent [search X] started (id: "));
    assert!(ack.ends_with("I'll notify you when it completes."));

    let report = next_report(&mut inbound).await;
    assert!(report.is_system());
    assert_eq!(report.sender_id, "subagent");
    assert_eq!(report.routing_key(), "telegram:7");
    assert!(report.content.starts_with("[Subagent 'search X' completed successfully]"));
    assert!(report.content.contains("X has 3 results"));
    assert_eq!(report.metadata["status"], "completed");

    let id = report.metadata["subagent_id"].as_str().unwrap().to_string();
    assert_eq!(mgr.status(&id), Some(SubagentStatus::Completed));
    let record = mgr.get(&id).unwrap();
    assert_eq!(record.result.as_deref(), Some("X has 3 results"));
    assert!(record.finished_at.is_some());
    assert_eq!(mgr.running_count(), 0);
    assert_no_more(&mut inbound).await;

    // Seeded with the task only, under its own prompt.
    let request = &provider.requests()[0];
    assert_eq!(request.messages.len(), 2);
    assert!(request.messages[0].text().unwrap().contains("background worker"));
    assert_eq!(request.messages[1].text(), Some("search X"));
}

#[tokio::test]
async fn subagent_tools_exclude_spawn_and_message() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::echo());
    let mgr = manager(provider.clone(), &bus, subagent_settings(Duration::from_secs(5)));

    mgr.spawn("list tools", Some("tools"), "cli", "1");
    next_report(&mut inbound).await;

    let names: Vec<String> = provider.requests()[0]
        .tools
        .iter()
        .map(|t| t.name.clone())
        .collect();
    assert_eq!(names, vec!["whereami".to_string()]);
}

#[tokio::test]
async fn failing_subagent_still_reports() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::new(vec![Step::Fail(ProviderError::Transport(
        "upstream 502".into(),
    ))]));
    let mgr = manager(provider, &bus, subagent_settings(Duration::from_secs(5)));

    mgr.spawn("doomed", Some("doomed"), "cli", "1");
    let report = next_report(&mut inbound).await;
    assert!(report.content.starts_with("[Subagent 'doomed' failed]"));
    assert!(report.content.contains("upstream 502"));
    assert_eq!(report.metadata["status"], "failed");
    let id = report.metadata["subagent_id"].as_str().unwrap();
    assert_eq!(mgr.status(id), Some(SubagentStatus::Failed));
    assert_no_more(&mut inbound).await;
}

#[tokio::test]
async fn wall_clock_timeout_reports_timed_out() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::new(vec![Step::Slow(
        Duration::from_secs(30),
        LLMResponse::text("never"),
    )]));
    let mgr = manager(provider, &bus, subagent_settings(Duration::from_millis(100)));

    mgr.spawn("slow job", Some("slow"), "cli", "1");
    let report = next_report(&mut inbound).await;
    assert!(report.content.starts_with("[Subagent 'slow' timed out]"));
    assert!(report.content.contains("timed out after"));
    assert_eq!(report.metadata["status"], "timed_out");
    let id = report.metadata["subagent_id"].as_str().unwrap();
    assert_eq!(mgr.status(id), Some(SubagentStatus::TimedOut));
}

#[tokio::test]
async fn iteration_cap_reports_timed_out() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let mgr = manager(
        Arc::new(LoopingProvider),
        &bus,
        subagent_settings(Duration::from_secs(5)),
    );

    mgr.spawn("spin", Some("spin"), "cli", "1");
    let report = next_report(&mut inbound).await;
    assert_eq!(report.metadata["status"], "timed_out");
    assert!(report.content.contains("Stopped after 4 iterations"));
}

#[tokio::test]
async fn cancel_and_shutdown_still_report() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::slow_echo(Duration::from_secs(30)));
    let mgr = manager(provider, &bus, subagent_settings(Duration::from_secs(60)));

    let (first, _) = mgr.launch("first", None, "cli", "1");
    mgr.launch("second", None, "cli", "2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mgr.running_count(), 2);

    assert!(mgr.cancel(&first));
    let report = next_report(&mut inbound).await;
    assert_eq!(report.metadata["subagent_id"], first.as_str());
    assert_eq!(report.metadata["status"], "failed");
    assert!(!mgr.cancel(&first));

    mgr.shutdown().await;
    let report = next_report(&mut inbound).await;
    assert_eq!(report.routing_key(), "cli:2");
    assert_eq!(report.metadata["status"], "failed");
    assert_eq!(mgr.running_count(), 0);
    assert_eq!(mgr.list().len(), 2);
}

#[tokio::test]
async fn concurrency_limit_queues_extra_subagents() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::slow_echo(Duration::from_millis(300)));
    let mgr = manager(
        provider,
        &bus,
        SubagentSettings {
            max_concurrent: 1,
            ..subagent_settings(Duration::from_secs(5))
        },
    );

    mgr.launch("one", None, "cli", "1");
    mgr.launch("two", None, "cli", "1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let statuses: Vec<_> = mgr.list().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses.iter().filter(|s| **s == SubagentStatus::Running).count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|s| **s == SubagentStatus::Pending).count(),
        1
    );

    next_report(&mut inbound).await;
    next_report(&mut inbound).await;
    assert!(mgr
        .list()
        .iter()
        .all(|s| s.status == SubagentStatus::Completed));
}

/// A spawn request gets an immediate acknowledgement; the subagent's findings
/// arrive later as a second reply on the same chat.
#[tokio::test]
async fn spawn_round_trip_through_agent_loop() {
    let workspace = tempfile::tempdir().unwrap();
    let bus = Arc::new(MessageBus::new(16));
    let mut outbound = bus.outbound_queue().await;
    let inbound = bus.inbound_queue().await;

    let main = Arc::new(ScriptedProvider::new(vec![
        Step::Reply(call("s1", "spawn", json!({"task": "search X"}))),
        Step::Reply(LLMResponse::text("I've started searching for X.")),
    ]));
    let worker = Arc::new(ScriptedProvider::new(vec![Step::Reply(LLMResponse::text(
        "Found 3 pages about X",
    ))]));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(MessageTool::new(bus.clone())));
    let subagents = Arc::new(SubagentManager::new(
        worker,
        &tools,
        bus.clone(),
        workspace.path().to_path_buf(),
        subagent_settings(Duration::from_secs(5)),
    ));
    tools.register(Arc::new(SpawnTool::new(subagents.clone())));

    let agent = Arc::new(AgentLoop::new(
        bus.clone(),
        main.clone(),
        Arc::new(SessionManager::in_memory()),
        context(workspace.path()),
        tools,
        settings(),
    ));
    let shutdown = CancellationToken::new();
    tokio::spawn(agent.clone().run(inbound, shutdown.clone()));

    bus.publish_inbound(InboundMessage::new("cli", "user", "1", "search X"))
        .await
        .unwrap();

    let ack = next_outbound(&mut outbound).await;
    assert_eq!(ack.chat_id, "1");
    assert_eq!(ack.content, "I've started searching for X.");

    let findings = next_outbound(&mut outbound).await;
    assert_eq!((findings.channel.as_str(), findings.chat_id.as_str()), ("cli", "1"));
    assert!(findings.content.contains("Found 3 pages about X"));

    // The spawn tool result told the model a subagent had started.
    let second = &main.requests()[1];
    assert!(second
        .messages
        .iter()
        .any(|m| m.text().is_some_and(|t| t.contains("started (id: "))));
    assert_eq!(subagents.list()[0].status, SubagentStatus::Completed);

    shutdown.cancel();
}

/// Queued subagents share the same wall-clock budget as running ones, so a
/// backlog cannot push reports past the configured timeout.
#[tokio::test]
async fn queued_subagents_time_out_on_schedule() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::slow_echo(Duration::from_secs(30)));
    let mgr = manager(
        provider,
        &bus,
        SubagentSettings {
            max_concurrent: 1,
            ..subagent_settings(Duration::from_millis(300))
        },
    );

    let started = tokio::time::Instant::now();
    for task in ["first", "second", "third"] {
        mgr.launch(task, None, "cli", "1");
    }
    for _ in 0..3 {
        let report = next_report(&mut inbound).await;
        assert_eq!(report.metadata["status"], "timed_out");
    }
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "reports took {:?}",
        started.elapsed()
    );
    assert!(mgr
        .list()
        .iter()
        .all(|s| s.status == SubagentStatus::TimedOut));
    assert_no_more(&mut inbound).await;
}

#[tokio::test]
async fn finished_records_are_pruned() {
    let bus = Arc::new(MessageBus::new(16));
    let mut inbound = bus.inbound_queue().await;
    let provider = Arc::new(ScriptedProvider::echo());
    let mgr = manager(
        provider,
        &bus,
        SubagentSettings {
            retention: Duration::ZERO,
            ..subagent_settings(Duration::from_secs(5))
        },
    );

    let (first, _) = mgr.launch("old job", None, "cli", "1");
    next_report(&mut inbound).await;
    assert_eq!(mgr.status(&first), Some(SubagentStatus::Completed));
    // A long retention window keeps it.
    assert_eq!(mgr.prune(Duration::from_secs(3600)), 0);

    // Launching applies the configured window; nothing running is touched.
    let (second, _) = mgr.launch("new job", None, "cli", "1");
    assert_eq!(mgr.status(&first), None);
    next_report(&mut inbound).await;
    assert_eq!(mgr.status(&second), Some(SubagentStatus::Completed));
    assert_eq!(mgr.prune(Duration::ZERO), 1);
    assert!(mgr.list().is_empty());
}
