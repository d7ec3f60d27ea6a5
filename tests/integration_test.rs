// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests for the core runtime using the mock model provider.
use std::sync::Arc;

use tokio::sync::mpsc;

use nexora_config::{Config, ModelConfig};
use nexora_core::{
    AgentEvent, AutoApprove, Coordinator, CoordinatorDeps, InMemoryMessageStore,
    InMemorySessionStore, RunOptions, RunOutcome, Session, SessionStore,
};

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

fn build_coordinator() -> (Arc<Coordinator>, Arc<InMemorySessionStore>) {
    let sessions = InMemorySessionStore::new();
    let deps = CoordinatorDeps {
        sessions: sessions.clone(),
        messages: InMemoryMessageStore::new(),
        permissions: Arc::new(AutoApprove),
        intrinsic_tools: vec![],
        mcp_tools: vec![],
    };
    let coordinator = Coordinator::new(mock_config(), deps).unwrap();
    coordinator.start();
    (coordinator, sessions)
}

#[tokio::test]
async fn coordinator_returns_mock_response() {
    let (coordinator, sessions) = build_coordinator();
    let session = sessions.create(Session::new()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let outcome = coordinator
        .run(&session.id, "hello", vec![], RunOptions::default(), tx)
        .await
        .unwrap();

    let RunOutcome::Completed(turn) = outcome else {
        panic!("expected a completed turn");
    };
    assert!(turn.message.text().contains("MOCK: hello"));

    let mut got_text = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::TextDelta(t) = event {
            assert!(t.contains("MOCK"));
            got_text = true;
        }
    }
    assert!(got_text, "expected at least one TextDelta event");
    coordinator.stop().await;
}

#[tokio::test]
async fn session_counters_accumulate_across_turns() {
    let (coordinator, sessions) = build_coordinator();
    let session = sessions.create(Session::new()).await.unwrap();

    for prompt in ["first", "second"] {
        let (tx, _rx) = mpsc::channel(64);
        coordinator
            .run(&session.id, prompt, vec![], RunOptions::default(), tx)
            .await
            .unwrap();
    }
    let session = sessions.get(&session.id).await.unwrap().unwrap();
    // The mock provider reports 10 prompt / 10 completion tokens per call.
    assert_eq!(session.prompt_tokens, 20);
    assert_eq!(session.completion_tokens, 20);
    assert_eq!(session.message_count, 4);
    coordinator.stop().await;
}

#[tokio::test]
async fn busy_and_queue_surface_is_exposed() {
    let (coordinator, sessions) = build_coordinator();
    let session = sessions.create(Session::new()).await.unwrap();
    assert!(!coordinator.is_busy());
    assert!(!coordinator.is_session_busy(&session.id));
    assert!(coordinator.queued_prompts(&session.id).is_empty());
    coordinator.stop().await;
}

#[tokio::test]
async fn delegation_pool_is_wired_to_sub_agents() {
    let (coordinator, sessions) = build_coordinator();
    let parent = sessions.create(Session::new()).await.unwrap();

    let id = coordinator
        .pool()
        .submit("audit dependencies", "", None, None, &parent.id);
    let result = coordinator.pool().wait(id).await.unwrap();
    assert!(result.contains("MOCK: audit dependencies"));
    coordinator.stop().await;
}
