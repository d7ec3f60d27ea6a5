// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-component scenarios driven through scripted mock providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use nexora_config::{AgentConfig, Config, ModelConfig};
use nexora_model::{
    catalog, ContentPart, FinishReason, Message, ModelCatalogEntry, ModelHandle, ModelProvider,
    CompletionRequest, ResponseEvent, Role, ScriptedMockProvider, Usage,
};
use nexora_tools::{Tool, ToolCall, ToolContext, ToolOutput, ToolRegistry};

use crate::{
    agent::{AutoApprove, RunOptions, RunOutcome, SessionAgent},
    background::{BackgroundCompactor, BackgroundCompactorConfig},
    coordinator::{Coordinator, CoordinatorDeps, ToolFactory},
    events::AgentEvent,
    session::{InMemoryMessageStore, InMemorySessionStore, MessageStore, Session, SessionStore},
};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

fn handle_for(provider: Arc<dyn ModelProvider>) -> ModelHandle {
    let mut entry = catalog::lookup("mock", "mock-model")
        .unwrap_or_else(|| ModelCatalogEntry::unknown("mock", "mock-model"));
    // The agent consults the catalog record for modality support, so the
    // mock's claim must land there.
    entry.supports_images = provider.supports_images();
    ModelHandle {
        provider,
        entry,
        config: ModelConfig {
            provider: "mock".into(),
            name: "mock-model".into(),
            ..ModelConfig::default()
        },
        options: Default::default(),
    }
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes its arguments"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }
    fn parallel_safe(&self) -> bool {
        true
    }
    async fn execute(&self, _ctx: &ToolContext, call: &ToolCall) -> ToolOutput {
        ToolOutput::ok(&call.id, format!("echo:{}", call.args))
    }
}

struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "kaboom"
    }
    fn description(&self) -> &str {
        "always panics"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _ctx: &ToolContext, _call: &ToolCall) -> ToolOutput {
        panic!("tool exploded")
    }
}

/// Provider that sleeps before answering, for busy/cancel scenarios.
struct SlowProvider {
    delay: Duration,
}

#[async_trait]
impl ModelProvider for SlowProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }
    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<nexora_model::ResponseStream> {
        tokio::time::sleep(self.delay).await;
        Ok(Box::pin(futures::stream::iter(vec![
            Ok(ResponseEvent::TextDelta("slow reply".into())),
            Ok(ResponseEvent::Finish(FinishReason::Stop)),
        ])))
    }
}

struct Fixture {
    agent: Arc<SessionAgent>,
    sessions: Arc<InMemorySessionStore>,
    messages: Arc<InMemoryMessageStore>,
    session: Session,
}

async fn fixture(provider: Arc<dyn ModelProvider>) -> Fixture {
    fixture_with(provider, AgentConfig::default(), default_registry()).await
}

fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    registry.register(PanicTool).unwrap();
    registry
}

async fn fixture_with(
    provider: Arc<dyn ModelProvider>,
    config: AgentConfig,
    registry: ToolRegistry,
) -> Fixture {
    let sessions = InMemorySessionStore::new();
    let messages = InMemoryMessageStore::new();
    let session = sessions.create(Session::new()).await.unwrap();
    let handle = handle_for(provider);
    let agent = SessionAgent::new(
        handle.clone(),
        handle,
        Arc::new(registry),
        sessions.clone(),
        messages.clone(),
        Arc::new(AutoApprove),
        config,
        Arc::new(BackgroundCompactor::new(BackgroundCompactorConfig::default())),
    );
    Fixture {
        agent,
        sessions,
        messages,
        session,
    }
}

fn events() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
    mpsc::channel(1024)
}

/// Pairing invariant: every ToolResult is preceded, in the same session, by
/// a ToolCall sharing its call ID.
fn assert_pairing(messages: &[Message]) {
    let mut seen_calls: Vec<&str> = Vec::new();
    for m in messages {
        for part in &m.parts {
            match part {
                ContentPart::ToolCall { id, .. } => seen_calls.push(id),
                ContentPart::ToolResult { call_id, .. } => {
                    assert!(
                        seen_calls.contains(&call_id.as_str()),
                        "tool result {call_id} has no preceding call"
                    );
                }
                _ => {}
            }
        }
    }
}

// ─── Plain turns ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn text_turn_persists_and_returns_final_message() {
    let f = fixture(Arc::new(ScriptedMockProvider::always_text("hello there"))).await;
    let (tx, _rx) = events();
    let outcome = f
        .agent
        .run(&f.session.id, "hi", vec![], RunOptions::default(), tx)
        .await
        .unwrap();
    let RunOutcome::Completed(turn) = outcome else {
        panic!("expected completion")
    };
    assert_eq!(turn.message.text(), "hello there");
    assert_eq!(turn.message.finish_reason(), Some(FinishReason::Stop));
    assert_eq!(turn.usage.prompt_tokens, 5);

    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    assert_eq!(stored.len(), 2, "user + assistant");
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[1].role, Role::Assistant);

    let session = f.sessions.get(&f.session.id).await.unwrap().unwrap();
    assert_eq!(session.prompt_tokens, 5);
    assert_eq!(session.completion_tokens, 5);
    assert!(!session.title.is_empty(), "title auto-generated after first turn");
}

#[tokio::test]
async fn empty_prompt_rejected() {
    let f = fixture(Arc::new(ScriptedMockProvider::always_text("x"))).await;
    let (tx, _rx) = events();
    let err = f
        .agent
        .run(&f.session.id, "   ", vec![], RunOptions::default(), tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("empty prompt"));
}

#[tokio::test]
async fn unknown_session_rejected() {
    let f = fixture(Arc::new(ScriptedMockProvider::always_text("x"))).await;
    let (tx, _rx) = events();
    let err = f
        .agent
        .run("no-such-session", "hi", vec![], RunOptions::default(), tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session not found"));
}

#[tokio::test]
async fn attachments_dropped_for_text_only_model() {
    let provider = Arc::new(ScriptedMockProvider::always_text("ok"));
    let f = fixture(provider.clone()).await;
    let (tx, _rx) = events();
    f.agent
        .run(
            &f.session.id,
            "look at this",
            vec![ContentPart::image("data:image/png;base64,AAAA")],
            RunOptions::default(),
            tx,
        )
        .await
        .unwrap();
    let req = provider.requests.lock().unwrap()[0].clone();
    let user = req.messages.iter().find(|m| m.role == Role::User).unwrap();
    assert!(user.image_urls().is_empty(), "attachment must be dropped silently");
}

#[tokio::test]
async fn attachments_kept_for_vision_model() {
    let provider = Arc::new(ScriptedMockProvider::always_text("ok").with_vision());
    let f = fixture(provider.clone()).await;
    let (tx, _rx) = events();
    f.agent
        .run(
            &f.session.id,
            "look",
            vec![ContentPart::image("data:image/png;base64,AAAA")],
            RunOptions::default(),
            tx,
        )
        .await
        .unwrap();
    let req = provider.requests.lock().unwrap()[0].clone();
    let user = req.messages.iter().find(|m| m.role == Role::User).unwrap();
    assert_eq!(user.image_urls().len(), 1);
}

// ─── Tool rounds ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_round_trip_preserves_pairing() {
    let provider = Arc::new(ScriptedMockProvider::tool_then_text(
        "call_1",
        "echo",
        r#"{"x": 1}"#,
        "all done",
    ));
    let f = fixture(provider.clone()).await;
    let (tx, mut rx) = events();
    let outcome = f
        .agent
        .run(&f.session.id, "use the tool", vec![], RunOptions::default(), tx)
        .await
        .unwrap();
    let RunOutcome::Completed(turn) = outcome else {
        panic!("expected completion")
    };
    assert_eq!(turn.message.text(), "all done");

    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    // user, assistant(tool call), tool result, assistant(final)
    assert_eq!(stored.len(), 4);
    assert_pairing(&stored);
    assert_eq!(stored[2].role, Role::Tool);
    match &stored[2].parts[0] {
        ContentPart::ToolResult { content, is_error, .. } => {
            assert!(content.contains("echo:"));
            assert!(!is_error);
        }
        other => panic!("wrong part: {other:?}"),
    }

    // The second model call must carry the tool result back.
    let second = provider.requests.lock().unwrap()[1].clone();
    assert_pairing(&second.messages);
    assert!(second.messages.iter().any(|m| m.role == Role::Tool));

    // Events include the tool lifecycle.
    let mut saw_started = false;
    let mut saw_finished = false;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            AgentEvent::ToolCallStarted(call) => {
                saw_started = true;
                assert_eq!(call.name, "echo");
            }
            AgentEvent::ToolCallFinished { is_error, .. } => {
                saw_finished = true;
                assert!(!is_error);
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_finished);
}

#[tokio::test]
async fn unknown_tool_yields_error_result_and_turn_continues() {
    let provider = Arc::new(ScriptedMockProvider::tool_then_text(
        "call_1",
        "not_registered",
        "{}",
        "recovered",
    ));
    let f = fixture(provider).await;
    let (tx, _rx) = events();
    let RunOutcome::Completed(turn) = f
        .agent
        .run(&f.session.id, "go", vec![], RunOptions::default(), tx)
        .await
        .unwrap()
    else {
        panic!("expected completion")
    };
    assert_eq!(turn.message.text(), "recovered");
    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    match &stored[2].parts[0] {
        ContentPart::ToolResult { is_error, content, .. } => {
            assert!(is_error);
            assert!(content.contains("unknown tool"));
        }
        other => panic!("wrong part: {other:?}"),
    }
}

#[tokio::test]
async fn panicking_tool_becomes_error_result() {
    let provider = Arc::new(ScriptedMockProvider::tool_then_text(
        "call_1",
        "kaboom",
        "{}",
        "survived",
    ));
    let f = fixture(provider).await;
    let (tx, _rx) = events();
    let RunOutcome::Completed(turn) = f
        .agent
        .run(&f.session.id, "go", vec![], RunOptions::default(), tx)
        .await
        .unwrap()
    else {
        panic!("expected completion")
    };
    assert_eq!(turn.message.text(), "survived");
    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    assert_pairing(&stored);
    let tool_msg = stored.iter().find(|m| m.role == Role::Tool).unwrap();
    match &tool_msg.parts[0] {
        ContentPart::ToolResult { is_error, .. } => assert!(is_error),
        other => panic!("wrong part: {other:?}"),
    }
}

#[tokio::test]
async fn permission_denied_produces_paired_error_result() {
    struct DenyAll;
    #[async_trait]
    impl crate::agent::PermissionService for DenyAll {
        async fn request(&self, _s: &str, _t: &str, _a: &serde_json::Value) -> bool {
            false
        }
    }

    let sessions = InMemorySessionStore::new();
    let messages = InMemoryMessageStore::new();
    let session = sessions.create(Session::new()).await.unwrap();
    let provider = Arc::new(ScriptedMockProvider::tool_then_text(
        "call_1",
        "echo",
        "{}",
        "understood",
    ));
    let handle = handle_for(provider);
    let agent = SessionAgent::new(
        handle.clone(),
        handle,
        Arc::new(default_registry()),
        sessions,
        messages.clone(),
        Arc::new(DenyAll),
        AgentConfig::default(),
        Arc::new(BackgroundCompactor::new(BackgroundCompactorConfig::default())),
    );
    let (tx, _rx) = events();
    agent
        .run(&session.id, "try", vec![], RunOptions::default(), tx)
        .await
        .unwrap();
    let stored = messages.list_by_session(&session.id).await.unwrap();
    assert_pairing(&stored);
    let tool_msg = stored.iter().find(|m| m.role == Role::Tool).unwrap();
    match &tool_msg.parts[0] {
        ContentPart::ToolResult { is_error, content, .. } => {
            assert!(is_error);
            assert!(content.contains("permission denied"));
        }
        other => panic!("wrong part: {other:?}"),
    }
}

// ─── Salvage integration ──────────────────────────────────────────────────────

#[tokio::test]
async fn text_format_tool_call_salvaged_and_executed() {
    let provider = Arc::new(ScriptedMockProvider::new(vec![
        vec![
            ResponseEvent::TextDelta(
                "<tool_call>{\"name\": \"echo\", \"arguments\": {\"k\": \"v\"}}</tool_call>".into(),
            ),
            ResponseEvent::Finish(FinishReason::Stop),
        ],
        vec![
            ResponseEvent::TextDelta("done after salvage".into()),
            ResponseEvent::Finish(FinishReason::Stop),
        ],
    ]));
    let f = fixture(provider.clone()).await;
    let (tx, _rx) = events();
    let RunOutcome::Completed(turn) = f
        .agent
        .run(&f.session.id, "go", vec![], RunOptions::default(), tx)
        .await
        .unwrap()
    else {
        panic!("expected completion")
    };
    assert_eq!(turn.message.text(), "done after salvage");
    assert_eq!(provider.calls(), 2, "salvaged call must trigger a tool round");

    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    assert_pairing(&stored);
    let call_msg = &stored[1];
    let calls = call_msg.tool_calls();
    assert_eq!(calls.len(), 1);
    match calls[0] {
        ContentPart::ToolCall { id, name, .. } => {
            assert_eq!(name, "echo");
            assert!(id.starts_with("call_"), "salvaged calls get minted ids");
        }
        other => panic!("wrong part: {other:?}"),
    }
}

// ─── Busy / queue / cancel ────────────────────────────────────────────────────

#[tokio::test]
async fn busy_session_queues_prompt_and_drains_fifo() {
    let f = fixture(Arc::new(SlowProvider {
        delay: Duration::from_millis(200),
    }))
    .await;
    let (tx, _rx) = events();

    let agent = f.agent.clone();
    let session_id = f.session.id.clone();
    let tx2 = tx.clone();
    let first = tokio::spawn(async move {
        agent
            .run(&session_id, "first", vec![], RunOptions::queued(), tx2)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.agent.is_session_busy(&f.session.id));

    let outcome = f
        .agent
        .run(&f.session.id, "second", vec![], RunOptions::queued(), tx.clone())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Queued { position: 1 }));
    assert_eq!(f.agent.queued_prompts(&f.session.id), vec!["second"]);

    first.await.unwrap().unwrap();
    // Queued prompt is picked up automatically.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
            let users: Vec<String> = stored
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.text())
                .collect();
            if users == vec!["first".to_string(), "second".to_string()]
                && !f.agent.is_session_busy(&f.session.id)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queued prompt must run after the first turn");
}

#[tokio::test]
async fn busy_session_without_queueing_errors() {
    let f = fixture(Arc::new(SlowProvider {
        delay: Duration::from_millis(200),
    }))
    .await;
    let (tx, _rx) = events();
    let agent = f.agent.clone();
    let session_id = f.session.id.clone();
    let tx2 = tx.clone();
    let first = tokio::spawn(async move {
        agent
            .run(&session_id, "first", vec![], RunOptions::queued(), tx2)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = f
        .agent
        .run(
            &f.session.id,
            "second",
            vec![],
            RunOptions::default(),
            tx,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session busy"));
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_aborts_turn_and_clears_busy_quickly() {
    let f = fixture(Arc::new(SlowProvider {
        delay: Duration::from_secs(10),
    }))
    .await;
    let (tx, _rx) = events();
    let agent = f.agent.clone();
    let session_id = f.session.id.clone();
    let run = tokio::spawn(async move {
        agent
            .run(&session_id, "never finishes", vec![], RunOptions::queued(), tx)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    f.agent.cancel(&f.session.id);
    let result = tokio::time::timeout(Duration::from_millis(500), run)
        .await
        .expect("cancel must unblock the turn promptly")
        .unwrap();
    assert!(matches!(result, Err(crate::agent::AgentError::Cancelled)));
    assert!(!f.agent.is_session_busy(&f.session.id));

    // The cancel marker carries a canceled finish reason.
    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    assert!(stored
        .iter()
        .any(|m| m.finish_reason() == Some(FinishReason::Canceled)));
}

#[tokio::test]
async fn cancel_clears_queue() {
    let f = fixture(Arc::new(SlowProvider {
        delay: Duration::from_millis(300),
    }))
    .await;
    let (tx, _rx) = events();
    let agent = f.agent.clone();
    let session_id = f.session.id.clone();
    let tx2 = tx.clone();
    let run = tokio::spawn(async move {
        agent
            .run(&session_id, "first", vec![], RunOptions::queued(), tx2)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.agent
        .run(&f.session.id, "queued", vec![], RunOptions::queued(), tx)
        .await
        .unwrap();
    f.agent.cancel(&f.session.id);
    let _ = run.await.unwrap();
    assert!(f.agent.queued_prompts(&f.session.id).is_empty());
}

// ─── Context limits ───────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_history_fails_with_context_exceeded() {
    let f = fixture(Arc::new(ScriptedMockProvider::always_text("x"))).await;
    // One message bigger than the whole 100k window survives even the
    // aggressive tail.
    f.messages
        .create(Message::user(&f.session.id, "y".repeat(500_000)))
        .await
        .unwrap();
    let (tx, _rx) = events();
    let err = f
        .agent
        .run(&f.session.id, "hello", vec![], RunOptions::default(), tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("context exceeded"), "got: {err}");
}

#[tokio::test]
async fn interrupted_tool_call_repaired_before_next_request() {
    let provider = Arc::new(ScriptedMockProvider::always_text("continuing"));
    let f = fixture(provider.clone()).await;
    // Simulate an interrupted stream: a persisted assistant tool call with
    // no result.
    let mut orphan = Message::assistant_streaming(&f.session.id);
    orphan.add_tool_call("call_lost", "echo", "{}");
    f.messages.create(orphan).await.unwrap();

    let (tx, _rx) = events();
    f.agent
        .run(&f.session.id, "keep going", vec![], RunOptions::default(), tx)
        .await
        .unwrap();

    let req = provider.requests.lock().unwrap()[0].clone();
    assert_pairing(&req.messages);
    let repaired = req
        .messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .any(|p| matches!(p, ContentPart::ToolResult { call_id, is_error, .. }
            if call_id == "call_lost" && *is_error));
    assert!(repaired, "orphan call must receive a synthesised error result");
}

// ─── Summarisation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn summarize_persists_flagged_message_and_compacts_context() {
    let provider = Arc::new(ScriptedMockProvider::new(vec![
        vec![
            ResponseEvent::TextDelta("I explored the repo and fixed the bug.".into()),
            ResponseEvent::Usage(Usage {
                prompt_tokens: 50,
                completion_tokens: 10,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            }),
            ResponseEvent::Finish(FinishReason::Stop),
        ],
        vec![
            ResponseEvent::TextDelta("next answer".into()),
            ResponseEvent::Finish(FinishReason::Stop),
        ],
    ]));
    let f = fixture(provider.clone()).await;
    for i in 0..20 {
        f.messages
            .create(Message::user(&f.session.id, format!("turn {i}")))
            .await
            .unwrap();
        f.messages
            .create(Message::assistant(&f.session.id, format!("reply {i}")))
            .await
            .unwrap();
    }

    let (tx, _rx) = events();
    let summary = f.agent.summarize(&f.session.id, tx).await.unwrap();
    assert!(summary.is_summary);
    assert!(summary.text().contains("fixed the bug"));

    // Only the summarisation path produces flagged messages.
    let stored = f.messages.list_by_session(&f.session.id).await.unwrap();
    assert_eq!(stored.iter().filter(|m| m.is_summary).count(), 1);

    // The next turn sends summary + bridge + recent tail, not the full log.
    let (tx, _rx) = events();
    f.agent
        .run(&f.session.id, "continue", vec![], RunOptions::default(), tx)
        .await
        .unwrap();
    let req = provider.requests.lock().unwrap()[1].clone();
    assert!(req.messages[0].is_summary);
    assert!(req.messages[1].text().contains("compacted"));
    assert!(
        req.messages.len() < 20,
        "pre-summary history must be truncated from the active context"
    );

    // Summarisation moved the session counters.
    let session = f.sessions.get(&f.session.id).await.unwrap().unwrap();
    assert_eq!(session.prompt_tokens, 50);
}

// ─── Coordinator ──────────────────────────────────────────────────────────────

fn mock_config() -> Config {
    Config {
        model: ModelConfig {
            provider: "mock".into(),
            name: "mock-model".into(),
            ..ModelConfig::default()
        },
        ..Config::default()
    }
}

fn coordinator_deps() -> (CoordinatorDeps, Arc<InMemorySessionStore>, Arc<InMemoryMessageStore>) {
    let sessions = InMemorySessionStore::new();
    let messages = InMemoryMessageStore::new();
    let deps = CoordinatorDeps {
        sessions: sessions.clone(),
        messages: messages.clone(),
        permissions: Arc::new(AutoApprove),
        intrinsic_tools: vec![
            ToolFactory::from_tool(Arc::new(EchoTool)),
        ],
        mcp_tools: vec![],
    };
    (deps, sessions, messages)
}

#[tokio::test]
async fn coordinator_runs_a_turn_end_to_end() {
    let (deps, sessions, _messages) = coordinator_deps();
    let coordinator = Coordinator::new(mock_config(), deps).unwrap();
    coordinator.start();
    let session = sessions.create(Session::new()).await.unwrap();

    let (tx, _rx) = events();
    let outcome = coordinator
        .run(&session.id, "hello", vec![], RunOptions::default(), tx)
        .await
        .unwrap();
    let RunOutcome::Completed(turn) = outcome else {
        panic!("expected completion")
    };
    assert!(turn.message.text().contains("MOCK: hello"));
    coordinator.stop().await;
}

#[tokio::test]
async fn coordinator_tool_list_includes_delegate_sorted() {
    let (deps, _sessions, _messages) = coordinator_deps();
    let coordinator = Coordinator::new(mock_config(), deps).unwrap();
    let tools = coordinator.tools().await;
    let names = tools.names();
    assert!(names.contains(&"delegate".to_string()));
    assert!(names.contains(&"echo".to_string()));
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[tokio::test]
async fn delegated_task_runs_sub_agent_and_credits_parent() {
    let (deps, sessions, _messages) = coordinator_deps();
    let coordinator = Coordinator::new(mock_config(), deps).unwrap();
    coordinator.start();
    let parent = sessions.create(Session::new()).await.unwrap();

    let id = coordinator
        .pool()
        .submit("inspect the build", "", None, None, &parent.id);
    let result = coordinator.pool().wait(id).await.unwrap();
    assert!(result.contains("MOCK: inspect the build"));

    // A child session exists with the parent link.
    let all = sessions.list().await.unwrap();
    let child = all
        .iter()
        .find(|s| s.parent_id.as_deref() == Some(parent.id.as_str()))
        .expect("task session created");
    assert_eq!(child.title, "inspect the build");
    coordinator.stop().await;
}

#[tokio::test]
async fn update_models_keeps_session_state() {
    let (deps, sessions, messages) = coordinator_deps();
    let coordinator = Coordinator::new(mock_config(), deps).unwrap();
    coordinator.start();
    let session = sessions.create(Session::new()).await.unwrap();
    let (tx, _rx) = events();
    coordinator
        .run(&session.id, "first", vec![], RunOptions::default(), tx)
        .await
        .unwrap();

    coordinator.update_models().await.unwrap();

    let stored = messages.list_by_session(&session.id).await.unwrap();
    assert_eq!(stored.len(), 2, "history survives a model rebuild");
    let (tx, _rx) = events();
    coordinator
        .run(&session.id, "second", vec![], RunOptions::default(), tx)
        .await
        .unwrap();
    let stored = messages.list_by_session(&session.id).await.unwrap();
    assert_eq!(stored.len(), 4);
    coordinator.stop().await;
}
