// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, FinishReason, CompletionRequest, ResponseEvent, Role, Usage};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage(Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            })),
            Ok(ResponseEvent::Finish(FinishReason::Stop)),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// response script from the front of the queue.  This lets tests specify
/// exact event sequences – including tool calls – without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ResponseEvent>>>>,
    name: String,
    supports_images: bool,
    /// Every `CompletionRequest` seen by this provider, in call order.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`ResponseEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "mock".into(),
            supports_images: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Declare image support so attachment stripping does not fire in tests
    /// that exercise multimodal paths.
    pub fn with_vision(mut self) -> Self {
        self.supports_images = true;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            }),
            ResponseEvent::Finish(FinishReason::Stop),
        ]])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Round 1 – model emits a tool call
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Finish(FinishReason::ToolCalls),
            ],
            // Round 2 – model responds after the tool result
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Finish(FinishReason::Stop),
            ],
        ])
    }

    /// Number of completion calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn supports_images(&self) -> bool {
        self.supports_images
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Finish(FinishReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{Message, ModelProvider};

    fn empty_req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("s1", "hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.complete(empty_req()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            ResponseEvent::TextDelta(t) => assert!(t.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_stop() {
        let p = MockProvider;
        let mut stream = p.complete(empty_req()).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(
            events.last(),
            Some(ResponseEvent::Finish(FinishReason::Stop))
        ));
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let p = ScriptedMockProvider::tool_then_text("call_1", "bash", r#"{"command":"ls"}"#, "done");

        let mut events = Vec::new();
        let mut stream = p.complete(empty_req()).await.unwrap();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::ToolCallDelta { name, .. } if name == "bash")));

        let mut events2 = Vec::new();
        let mut stream2 = p.complete(empty_req()).await.unwrap();
        while let Some(ev) = stream2.next().await {
            events2.push(ev.unwrap());
        }
        assert!(events2
            .iter()
            .any(|e| matches!(e, ResponseEvent::TextDelta(t) if t == "done")));
        assert_eq!(p.calls(), 2);
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let mut stream = p.complete(empty_req()).await.unwrap();
        let ev = stream.next().await.unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t.contains("no more scripts")));
    }
}
